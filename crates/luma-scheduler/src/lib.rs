//! Clock-driven events and script timers
//!
//! The scheduler runs one task with a 1-second tick. At whole-minute
//! boundaries it matches time patterns against the `events/time/` tree and
//! emits time events; on every tick it fires due timers. Timer callbacks
//! are opaque to this crate: scripts register `(CallbackHandle,
//! InterpreterId)` pairs and the executor installs a [`CallbackInvoker`]
//! at wiring time, so the scheduler never learns the script language.

mod pattern;
mod sun;

pub use pattern::{parse_offset, TimePattern};
pub use sun::{sun_times, SunTimes};

use chrono::{DateTime, Datelike, Local, Timelike};
use luma_core::{Event, EventSink, EventSource, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identifies one live interpreter instance inside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterpreterId(pub u64);

impl std::fmt::Display for InterpreterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lua#{}", self.0)
    }
}

/// Identifies one retained callback closure inside its interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(pub u64);

/// Executor-side callback entry points, installed after construction.
///
/// `invoke` runs the closure (the implementor owns all interpreter
/// concurrency); `release` tells the executor the timer no longer holds
/// the closure, either because a one-shot fired or because it was
/// cancelled.
pub trait CallbackInvoker: Send + Sync {
    fn invoke(&self, callback: CallbackHandle, owner: InterpreterId, timer_id: &str);
    fn release(&self, callback: CallbackHandle, owner: InterpreterId, timer_id: &str);
}

/// Scheduler construction parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// The `<config>/events/` tree the time patterns live under.
    pub events_dir: PathBuf,
    /// Coordinates for sun computations. When unset, sunrise/sunset
    /// events are disabled rather than guessed.
    pub coordinates: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
struct TimerEntry {
    id: String,
    trigger_time: DateTime<Local>,
    callback: CallbackHandle,
    owner: InterpreterId,
    recurring: bool,
    interval: Duration,
}

/// One due timer pulled out of the table for dispatch.
#[derive(Debug, Clone)]
struct FiredTimer {
    id: String,
    trigger_time: DateTime<Local>,
    callback: CallbackHandle,
    owner: InterpreterId,
    recurring: bool,
}

/// Per-day tick state.
pub(crate) struct DayState {
    pub(crate) last_minute: i32,
    pub(crate) last_day: u32,
    pub(crate) sun: Option<SunTimes>,
}

/// The scheduler.
pub struct Scheduler {
    events_dir: PathBuf,
    coordinates: Option<(f64, f64)>,
    timers: Mutex<HashMap<String, TimerEntry>>,
    invoker: RwLock<Option<Weak<dyn CallbackInvoker>>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            events_dir: config.events_dir,
            coordinates: config.coordinates,
            timers: Mutex::new(HashMap::new()),
            invoker: RwLock::new(None),
            stop: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Install the executor-side callback entry points.
    ///
    /// Held weakly; the executor owns itself and the scheduler must not
    /// keep it alive.
    pub fn set_invoker(&self, invoker: &Arc<dyn CallbackInvoker>) {
        *self.invoker.write().unwrap() = Some(Arc::downgrade(invoker));
    }

    /// Start the tick loop, emitting time events into `sink`.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn EventSink>) {
        let scheduler = Arc::clone(self);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop.lock().unwrap() = Some(stop_tx);

        let handle = tokio::spawn(async move {
            let now = Local::now();
            let mut state = DayState {
                last_minute: -1,
                last_day: now.day(),
                sun: scheduler.compute_sun(now),
            };

            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Local::now();
                        if now.second() == 0 {
                            scheduler.check_time_events(now, &mut state, sink.as_ref());
                        }
                        scheduler.fire_due(now);
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Scheduler tick loop stopped");
        });
        *self.task.lock().unwrap() = Some(handle);
        info!("Scheduler started");
    }

    /// Stop the tick loop and wait for it to finish.
    pub async fn stop(&self) {
        let stop = self.stop.lock().unwrap().take();
        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Scheduler stopped");
    }

    /// Register a one-shot timer. An existing timer with the same id is
    /// replaced and its callback released.
    pub fn add_timer(
        &self,
        id: &str,
        trigger_time: DateTime<Local>,
        callback: CallbackHandle,
        owner: InterpreterId,
    ) {
        let entry = TimerEntry {
            id: id.to_string(),
            trigger_time,
            callback,
            owner,
            recurring: false,
            interval: Duration::ZERO,
        };
        self.install(entry);
        info!(timer = %id, at = %trigger_time.format("%Y-%m-%d %H:%M:%S"), "Timer added");
    }

    /// Register a recurring timer, first firing one interval from now.
    pub fn add_recurring(
        &self,
        id: &str,
        interval: Duration,
        callback: CallbackHandle,
        owner: InterpreterId,
    ) {
        let entry = TimerEntry {
            id: id.to_string(),
            trigger_time: Local::now()
                + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero()),
            callback,
            owner,
            recurring: true,
            interval,
        };
        self.install(entry);
        info!(timer = %id, every = ?interval, "Recurring timer added");
    }

    /// Cancel a timer. Best-effort: a timer already dequeued for firing
    /// proceeds. Returns whether the timer existed.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.timers.lock().unwrap().remove(id);
        match removed {
            Some(entry) => {
                info!(timer = %id, "Timer removed");
                self.release(&entry);
                true
            }
            None => false,
        }
    }

    /// Ids of all armed timers, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn install(&self, entry: TimerEntry) {
        let replaced = self
            .timers
            .lock()
            .unwrap()
            .insert(entry.id.clone(), entry);
        if let Some(old) = replaced {
            debug!(timer = %old.id, "Replacing existing timer");
            self.release(&old);
        }
    }

    fn release(&self, entry: &TimerEntry) {
        if let Some(invoker) = self.invoker() {
            invoker.release(entry.callback, entry.owner, &entry.id);
        }
    }

    fn invoker(&self) -> Option<Arc<dyn CallbackInvoker>> {
        self.invoker.read().unwrap().as_ref()?.upgrade()
    }

    fn compute_sun(&self, now: DateTime<Local>) -> Option<SunTimes> {
        let (latitude, longitude) = self.coordinates?;
        let sun = sun_times(latitude, longitude, now.date_naive());
        if let Some(sun) = &sun {
            info!(
                sunrise = %sun.sunrise.format("%H:%M"),
                sunset = %sun.sunset.format("%H:%M"),
                "Computed sun times"
            );
        }
        sun
    }

    /// Minute-boundary work: day rollover, pattern matching, emission.
    ///
    /// Sun times are recomputed before any pattern is checked, so
    /// minute-0 events of a new day already see the new values.
    pub(crate) fn check_time_events(
        &self,
        now: DateTime<Local>,
        state: &mut DayState,
        sink: &dyn EventSink,
    ) {
        if now.day() != state.last_day {
            state.last_day = now.day();
            state.sun = self.compute_sun(now);
        }

        let minute = now.minute() as i32;
        if minute == state.last_minute {
            return;
        }
        state.last_minute = minute;

        for event_type in self.matching_patterns(now, state.sun.as_ref()) {
            debug!(pattern = %event_type, "Time pattern matched");
            sink.dispatch(time_event(&event_type, now));
        }
    }

    /// All pattern directories matching the current minute, in emission
    /// order: clock wildcards narrowest-last, then sunrise, sunset, and
    /// their offsets.
    fn matching_patterns(&self, now: DateTime<Local>, sun: Option<&SunTimes>) -> Vec<String> {
        let time_dir = self.events_dir.join("time");
        let Ok(entries) = std::fs::read_dir(&time_dir) else {
            return Vec::new();
        };

        let (hour, minute) = (now.hour(), now.minute());
        // (rank, name) pairs; rank keeps emission order stable across
        // directory scan order.
        let mut matched: Vec<(u8, String)> = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            match name.as_str() {
                "sunrise" | "sunset" => {
                    let Some(sun) = sun else { continue };
                    let (base, rank) = if name == "sunrise" {
                        (sun.sunrise, 4)
                    } else {
                        (sun.sunset, 5)
                    };
                    if base.hour() == hour && base.minute() == minute && dir_has_artifacts(&path) {
                        matched.push((rank, name.clone()));
                    }
                    matched.extend(
                        offset_matches(&path, base, hour, minute)
                            .into_iter()
                            .map(|child| (rank + 2, format!("{name}/{child}"))),
                    );
                }
                _ => {
                    let Some(pattern) = TimePattern::parse(&name) else {
                        continue;
                    };
                    if pattern.matches(hour, minute) && dir_has_artifacts(&path) {
                        matched.push((pattern.rank(), name));
                    }
                }
            }
        }

        matched.sort();
        matched.into_iter().map(|(_, name)| name).collect()
    }

    /// Fire all timers due at `now`.
    ///
    /// Due entries are pulled out under the table lock, then dispatched in
    /// `(trigger_time, id)` order on a detached task so the tick loop
    /// never waits on a callback.
    pub(crate) fn fire_due(&self, now: DateTime<Local>) {
        let mut due: Vec<FiredTimer> = Vec::new();
        {
            let mut timers = self.timers.lock().unwrap();
            let ids: Vec<String> = timers
                .values()
                .filter(|t| t.trigger_time <= now)
                .map(|t| t.id.clone())
                .collect();

            for id in ids {
                let Some(entry) = timers.get_mut(&id) else {
                    continue;
                };
                due.push(FiredTimer {
                    id: entry.id.clone(),
                    trigger_time: entry.trigger_time,
                    callback: entry.callback,
                    owner: entry.owner,
                    recurring: entry.recurring,
                });
                if entry.recurring {
                    entry.trigger_time = now
                        + chrono::Duration::from_std(entry.interval)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                } else {
                    timers.remove(&id);
                }
            }
        }

        if due.is_empty() {
            return;
        }
        due.sort_by(|a, b| {
            a.trigger_time
                .cmp(&b.trigger_time)
                .then_with(|| a.id.cmp(&b.id))
        });

        let Some(invoker) = self.invoker() else {
            warn!("Timers due but no callback invoker installed");
            return;
        };

        tokio::task::spawn_blocking(move || {
            for timer in due {
                debug!(timer = %timer.id, "Firing timer");
                invoker.invoke(timer.callback, timer.owner, &timer.id);
                if !timer.recurring {
                    invoker.release(timer.callback, timer.owner, &timer.id);
                }
            }
        });
    }
}

/// Offset sub-directories of a sunrise/sunset directory whose target time
/// is the current minute, sorted by name.
fn offset_matches(base_dir: &Path, base: DateTime<Local>, hour: u32, minute: u32) -> Vec<String> {
    let Ok(children) = std::fs::read_dir(base_dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = children
        .flatten()
        .filter(|c| c.path().is_dir())
        .filter_map(|c| {
            let name = c.file_name().to_string_lossy().into_owned();
            let offset = parse_offset(&name)?;
            let target = base + chrono::Duration::minutes(i64::from(offset));
            (target.hour() == hour && target.minute() == minute && dir_has_artifacts(&c.path()))
                .then_some(name)
        })
        .collect();
    names.sort();
    names
}

/// Whether a pattern directory holds at least one script artifact.
fn dir_has_artifacts(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|e| {
        e.path().is_file() && e.file_name().to_string_lossy().ends_with(".lua")
    })
}

fn time_event(event_type: &str, now: DateTime<Local>) -> Event {
    Event::new(EventSource::Time, event_type).with_data(HashMap::from([
        ("time".to_string(), Value::Int(now.timestamp())),
        ("hour".to_string(), Value::Int(i64::from(now.hour()))),
        ("minute".to_string(), Value::Int(i64::from(now.minute()))),
        ("second".to_string(), Value::Int(i64::from(now.second()))),
        (
            "weekday".to_string(),
            Value::Int(i64::from(now.weekday().num_days_from_sunday())),
        ),
    ]))
}

/// Thread-safe handle to the scheduler
pub type SharedScheduler = Arc<Scheduler>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingInvoker {
        calls: StdMutex<Vec<String>>,
    }

    impl CallbackInvoker for RecordingInvoker {
        fn invoke(&self, _callback: CallbackHandle, _owner: InterpreterId, timer_id: &str) {
            self.calls.lock().unwrap().push(format!("invoke:{timer_id}"));
        }
        fn release(&self, _callback: CallbackHandle, _owner: InterpreterId, timer_id: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("release:{timer_id}"));
        }
    }

    #[derive(Default)]
    struct CollectSink {
        events: StdMutex<Vec<Event>>,
    }

    impl EventSink for CollectSink {
        fn dispatch(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn scheduler_at(dir: &TempDir, coordinates: Option<(f64, f64)>) -> Arc<Scheduler> {
        Scheduler::new(SchedulerConfig {
            events_dir: dir.path().join("events"),
            coordinates,
        })
    }

    fn make_pattern_dir(dir: &TempDir, pattern: &str) {
        let path = dir.path().join("events").join("time").join(pattern);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("handler.lua"), "-- handler").unwrap();
    }

    fn local(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 21, h, m, s).unwrap()
    }

    fn day_state(now: DateTime<Local>, sun: Option<SunTimes>) -> DayState {
        DayState {
            last_minute: -1,
            last_day: now.day(),
            sun,
        }
    }

    #[test]
    fn test_timer_add_list_remove() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_at(&dir, None);

        scheduler.add_timer("b", local(10, 0, 0), CallbackHandle(1), InterpreterId(1));
        scheduler.add_timer("a", local(10, 0, 0), CallbackHandle(2), InterpreterId(1));
        assert_eq!(scheduler.list(), vec!["a", "b"]);

        assert!(scheduler.remove("a"));
        assert!(!scheduler.remove("a"));
        assert_eq!(scheduler.list(), vec!["b"]);
    }

    #[test]
    fn test_remove_releases_callback() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_at(&dir, None);
        let invoker = Arc::new(RecordingInvoker::default());
        let as_dyn: Arc<dyn CallbackInvoker> = invoker.clone();
        scheduler.set_invoker(&as_dyn);

        scheduler.add_timer("t", local(10, 0, 0), CallbackHandle(1), InterpreterId(1));
        scheduler.remove("t");

        assert_eq!(*invoker.calls.lock().unwrap(), vec!["release:t"]);
    }

    #[test]
    fn test_add_same_id_replaces_and_releases_old() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_at(&dir, None);
        let invoker = Arc::new(RecordingInvoker::default());
        let as_dyn: Arc<dyn CallbackInvoker> = invoker.clone();
        scheduler.set_invoker(&as_dyn);

        scheduler.add_timer("t", local(10, 0, 0), CallbackHandle(1), InterpreterId(1));
        scheduler.add_timer("t", local(11, 0, 0), CallbackHandle(2), InterpreterId(1));

        assert_eq!(scheduler.list(), vec!["t"]);
        assert_eq!(*invoker.calls.lock().unwrap(), vec!["release:t"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fire_due_order_and_release() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_at(&dir, None);
        let invoker = Arc::new(RecordingInvoker::default());
        let as_dyn: Arc<dyn CallbackInvoker> = invoker.clone();
        scheduler.set_invoker(&as_dyn);

        // Same trigger time for b/a breaks ties lexically; c fires first.
        scheduler.add_timer("b", local(9, 0, 0), CallbackHandle(1), InterpreterId(1));
        scheduler.add_timer("a", local(9, 0, 0), CallbackHandle(2), InterpreterId(1));
        scheduler.add_timer("c", local(8, 0, 0), CallbackHandle(3), InterpreterId(1));

        scheduler.fire_due(local(10, 0, 0));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *invoker.calls.lock().unwrap(),
            vec![
                "invoke:c",
                "release:c",
                "invoke:a",
                "release:a",
                "invoke:b",
                "release:b"
            ]
        );
        assert!(scheduler.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recurring_rearms_without_release() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_at(&dir, None);
        let invoker = Arc::new(RecordingInvoker::default());
        let as_dyn: Arc<dyn CallbackInvoker> = invoker.clone();
        scheduler.set_invoker(&as_dyn);

        scheduler.add_recurring(
            "tick",
            Duration::from_secs(300),
            CallbackHandle(1),
            InterpreterId(1),
        );
        let far_future = Local::now() + chrono::Duration::hours(1);
        scheduler.fire_due(far_future);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*invoker.calls.lock().unwrap(), vec!["invoke:tick"]);
        // Still armed for the next interval.
        assert_eq!(scheduler.list(), vec!["tick"]);
    }

    #[test]
    fn test_minute_patterns_match_in_order() {
        let dir = TempDir::new().unwrap();
        for pattern in ["*_*", "*_30", "10_*", "10_30", "11_00", "*_45"] {
            make_pattern_dir(&dir, pattern);
        }
        let scheduler = scheduler_at(&dir, None);
        let sink = CollectSink::default();

        let now = local(10, 30, 0);
        let mut state = day_state(now, None);
        scheduler.check_time_events(now, &mut state, &sink);

        let types: Vec<String> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        assert_eq!(types, vec!["*_*", "*_30", "10_*", "10_30"]);
    }

    #[test]
    fn test_pattern_without_artifacts_is_silent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events").join("time").join("*_*");
        std::fs::create_dir_all(&path).unwrap();

        let scheduler = scheduler_at(&dir, None);
        let sink = CollectSink::default();
        let now = local(10, 30, 0);
        let mut state = day_state(now, None);
        scheduler.check_time_events(now, &mut state, &sink);

        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_same_minute_fires_once() {
        let dir = TempDir::new().unwrap();
        make_pattern_dir(&dir, "*_*");
        let scheduler = scheduler_at(&dir, None);
        let sink = CollectSink::default();

        let mut state = day_state(local(10, 30, 0), None);
        scheduler.check_time_events(local(10, 30, 0), &mut state, &sink);
        scheduler.check_time_events(local(10, 30, 0), &mut state, &sink);

        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_sunrise_and_offset() {
        let dir = TempDir::new().unwrap();
        make_pattern_dir(&dir, "sunrise");
        make_pattern_dir(&dir, "sunrise/-00_30");
        let scheduler = scheduler_at(&dir, None);

        let sun = SunTimes {
            sunrise: local(4, 30, 0),
            sunset: local(21, 15, 0),
        };

        // 30 minutes before sunrise only the offset handler fires.
        let sink = CollectSink::default();
        let now = local(4, 0, 0);
        let mut state = day_state(now, Some(sun));
        scheduler.check_time_events(now, &mut state, &sink);
        let types: Vec<String> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        assert_eq!(types, vec!["sunrise/-00_30"]);

        // At sunrise only the plain handler fires.
        let sink = CollectSink::default();
        let now = local(4, 30, 0);
        let mut state = day_state(now, Some(sun));
        scheduler.check_time_events(now, &mut state, &sink);
        let types: Vec<String> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        assert_eq!(types, vec!["sunrise"]);
    }

    #[test]
    fn test_sun_disabled_without_coordinates() {
        let dir = TempDir::new().unwrap();
        make_pattern_dir(&dir, "sunset");
        let scheduler = scheduler_at(&dir, None);
        let sink = CollectSink::default();

        let now = local(21, 15, 0);
        let mut state = day_state(now, None);
        scheduler.check_time_events(now, &mut state, &sink);

        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_day_rollover_recomputes_sun_before_patterns() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_at(&dir, Some((55.7558, 37.6173)));
        let sink = CollectSink::default();

        let now = local(0, 0, 0);
        let mut state = DayState {
            last_minute: -1,
            last_day: now.day() - 1,
            sun: None,
        };
        scheduler.check_time_events(now, &mut state, &sink);

        assert_eq!(state.last_day, now.day());
        assert!(state.sun.is_some());
    }

    #[test]
    fn test_time_event_payload() {
        let now = local(6, 7, 0);
        let event = time_event("06_07", now);

        assert_eq!(event.source, EventSource::Time);
        assert_eq!(event.event_type, "06_07");
        assert_eq!(event.data.get("hour"), Some(&Value::Int(6)));
        assert_eq!(event.data.get("minute"), Some(&Value::Int(7)));
        assert_eq!(event.data.get("second"), Some(&Value::Int(0)));
        // 2025-06-21 is a Saturday; weekday counts from Sunday = 0.
        assert_eq!(event.data.get("weekday"), Some(&Value::Int(6)));
    }
}
