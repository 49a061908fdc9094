//! Script executor and interpreter lifetime management
//!
//! Every dispatched event gets a fresh interpreter. A tracker records the
//! borrows on it: the initial execution holds one, and every timer the
//! script registers holds another. The interpreter closes exactly when
//! both counts reach zero, which is what lets timer closures outlive the
//! script run that created them.

use crate::host;
use crate::{ScriptError, ScriptResult};
use dashmap::DashMap;
use luma_core::{Event, EventSink};
use luma_registry::DeviceRegistry;
use luma_scheduler::{CallbackHandle, CallbackInvoker, InterpreterId, Scheduler};
use luma_store::StateStore;
use mlua::{HookTriggers, Lua, RegistryKey};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default per-invocation deadline.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);

/// How many VM instructions run between deadline checks.
const DEADLINE_CHECK_INSTRUCTIONS: u32 = 4096;

/// Marker the deadline hook raises; mapped back to [`ScriptError::Timeout`].
const DEADLINE_MARKER: &str = "__luma_deadline__";

/// Helper libraries preloaded from `<config>/lib/` when present.
const HELPER_PRELOADS: &[(&str, &str)] = &[("color", "color_helpers"), ("net", "net_helpers")];

/// Borrow counters for one interpreter.
pub(crate) struct RefCounts {
    pub(crate) ref_count: u32,
    pub(crate) active_timers: u32,
}

/// Tracker attached one-to-one to a live interpreter.
pub(crate) struct InterpreterTracker {
    pub(crate) id: InterpreterId,
    pub(crate) lua: Lua,
    pub(crate) counts: Mutex<RefCounts>,
    /// Serialises every invocation inside this interpreter: the initial
    /// run and all timer callbacks.
    pub(crate) exec_lock: Mutex<()>,
    /// Closures retained for the scheduler, pinned in the Lua registry.
    pub(crate) callbacks: Mutex<HashMap<CallbackHandle, RegistryKey>>,
    pub(crate) timers_created: AtomicBool,
}

pub(crate) struct ExecutorInner {
    pub(crate) store: Arc<StateStore>,
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) scheduler: OnceLock<Arc<Scheduler>>,
    pub(crate) events: OnceLock<Arc<dyn EventSink>>,
    pub(crate) config_dir: PathBuf,
    pub(crate) script_timeout: Duration,
    trackers: DashMap<InterpreterId, Arc<InterpreterTracker>>,
    next_interpreter: AtomicU64,
    next_callback: AtomicU64,
}

/// The script executor.
#[derive(Clone)]
pub struct ScriptExecutor {
    inner: Arc<ExecutorInner>,
}

impl ScriptExecutor {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<DeviceRegistry>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                registry,
                scheduler: OnceLock::new(),
                events: OnceLock::new(),
                config_dir: config_dir.into(),
                script_timeout: SCRIPT_TIMEOUT,
                trackers: DashMap::new(),
                next_interpreter: AtomicU64::new(0),
                next_callback: AtomicU64::new(0),
            }),
        }
    }

    /// Override the per-invocation deadline. Only meaningful before any
    /// script has run; used by tests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_timeout must be called before the executor is shared");
        inner.script_timeout = timeout;
        self
    }

    /// Attach the scheduler timers are registered with. Called once at
    /// wiring time.
    pub fn attach_scheduler(&self, scheduler: Arc<Scheduler>) {
        if self.inner.scheduler.set(scheduler).is_err() {
            warn!("Scheduler attached twice, keeping the first");
        }
    }

    /// Attach the sink that `state.set` change events go to.
    pub fn attach_event_sink(&self, sink: Arc<dyn EventSink>) {
        if self.inner.events.set(sink).is_err() {
            warn!("Event sink attached twice, keeping the first");
        }
    }

    /// The callback entry points the scheduler calls timers back through.
    pub fn invoker_handle(&self) -> Arc<dyn CallbackInvoker> {
        self.inner.clone()
    }

    /// Run a script artifact against an event in a fresh interpreter.
    pub fn execute(&self, artifact: &Path, event: &Event) -> ScriptResult<()> {
        self.inner.execute(artifact, event)
    }

    /// Run a retained timer callback inside its owning interpreter.
    pub fn invoke_callback(
        &self,
        callback: CallbackHandle,
        owner: InterpreterId,
        timer_id: &str,
    ) -> ScriptResult<()> {
        self.inner.invoke_callback(callback, owner, timer_id)
    }

    /// Number of interpreters currently kept alive by borrows.
    pub fn live_interpreters(&self) -> usize {
        self.inner.trackers.len()
    }
}

impl ExecutorInner {
    pub(crate) fn execute(self: &Arc<Self>, artifact: &Path, event: &Event) -> ScriptResult<()> {
        if !artifact.is_file() {
            return Err(ScriptError::MissingArtifact {
                path: artifact.to_path_buf(),
            });
        }
        let source = std::fs::read_to_string(artifact).map_err(|e| ScriptError::Load {
            path: artifact.to_path_buf(),
            message: e.to_string(),
        })?;

        let id = InterpreterId(self.next_interpreter.fetch_add(1, Ordering::Relaxed) + 1);
        let tracker = Arc::new(InterpreterTracker {
            id,
            lua: Lua::new(),
            counts: Mutex::new(RefCounts {
                ref_count: 1,
                active_timers: 0,
            }),
            exec_lock: Mutex::new(()),
            callbacks: Mutex::new(HashMap::new()),
            timers_created: AtomicBool::new(false),
        });
        self.trackers.insert(id, tracker.clone());
        debug!(interpreter = %id, artifact = %artifact.display(), "Interpreter created");

        let result = self.run_artifact(&tracker, artifact, &source, event);

        if tracker.timers_created.load(Ordering::Relaxed) {
            debug!(interpreter = %id, "Script registered timers, they keep the interpreter alive");
        }

        // The initial execution borrow ends here. Outstanding timers hold
        // their own borrows and keep the interpreter alive.
        {
            let mut counts = tracker.counts.lock().unwrap();
            counts.ref_count = counts.ref_count.saturating_sub(1);
        }
        self.try_close(&tracker);

        result
    }

    fn run_artifact(
        self: &Arc<Self>,
        tracker: &Arc<InterpreterTracker>,
        artifact: &Path,
        source: &str,
        event: &Event,
    ) -> ScriptResult<()> {
        self.setup_environment(tracker, artifact, event)
            .map_err(|e| ScriptError::Load {
                path: artifact.to_path_buf(),
                message: format_lua_error(&e),
            })?;

        let _guard = tracker.exec_lock.lock().unwrap();
        let lua = tracker.lua.clone();
        let chunk_name = artifact.display().to_string();
        let result = self.run_with_deadline(&tracker.lua, move || {
            lua.load(source).set_name(chunk_name).exec()
        });

        result.map_err(|e| self.classify_error(e, Some(artifact)))
    }

    pub(crate) fn invoke_callback(
        &self,
        callback: CallbackHandle,
        owner: InterpreterId,
        timer_id: &str,
    ) -> ScriptResult<()> {
        let tracker = self
            .trackers
            .get(&owner)
            .map(|t| Arc::clone(t.value()))
            .ok_or(ScriptError::UnknownInterpreter(owner))?;

        let func: mlua::Function = {
            let callbacks = tracker.callbacks.lock().unwrap();
            let key = callbacks
                .get(&callback)
                .ok_or_else(|| ScriptError::UnknownCallback {
                    timer: timer_id.to_string(),
                })?;
            tracker
                .lua
                .registry_value(key)
                .map_err(|e| ScriptError::Runtime(format_lua_error(&e)))?
        };

        let _guard = tracker.exec_lock.lock().unwrap();
        debug!(timer = %timer_id, interpreter = %owner, "Callback invocation started");

        let result = self.run_with_deadline(&tracker.lua, move || func.call::<()>(()));
        result.map_err(|e| self.classify_error(e, None))
    }

    /// Drop a timer's borrow: forget the retained closure and close the
    /// interpreter when this was the last borrow.
    pub(crate) fn release_timer(
        &self,
        callback: CallbackHandle,
        owner: InterpreterId,
        timer_id: &str,
    ) {
        let Some(tracker) = self.trackers.get(&owner).map(|t| Arc::clone(t.value())) else {
            warn!(timer = %timer_id, interpreter = %owner, "Releasing timer on untracked interpreter");
            return;
        };

        if let Some(key) = tracker.callbacks.lock().unwrap().remove(&callback) {
            let _ = tracker.lua.remove_registry_value(key);
        }

        let remaining = {
            let mut counts = tracker.counts.lock().unwrap();
            counts.active_timers = counts.active_timers.saturating_sub(1);
            counts.active_timers
        };
        debug!(timer = %timer_id, interpreter = %owner, active = remaining, "Timer borrow released");

        self.try_close(&tracker);
    }

    /// Retain a closure for the scheduler and add its borrow.
    pub(crate) fn register_callback(
        &self,
        owner: InterpreterId,
        func: mlua::Function,
    ) -> mlua::Result<CallbackHandle> {
        let tracker = self
            .trackers
            .get(&owner)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| mlua::Error::RuntimeError(format!("interpreter {owner} not tracked")))?;

        let key = tracker.lua.create_registry_value(func)?;
        let handle = CallbackHandle(self.next_callback.fetch_add(1, Ordering::Relaxed) + 1);
        tracker.callbacks.lock().unwrap().insert(handle, key);

        let active = {
            let mut counts = tracker.counts.lock().unwrap();
            counts.active_timers += 1;
            counts.active_timers
        };
        tracker.timers_created.store(true, Ordering::Relaxed);
        debug!(interpreter = %owner, active = active, "Timer borrow added");

        Ok(handle)
    }

    fn try_close(&self, tracker: &Arc<InterpreterTracker>) {
        let done = {
            let counts = tracker.counts.lock().unwrap();
            counts.ref_count == 0 && counts.active_timers == 0
        };
        if done && self.trackers.remove(&tracker.id).is_some() {
            debug!(interpreter = %tracker.id, "Interpreter closed");
        }
    }

    fn setup_environment(
        self: &Arc<Self>,
        tracker: &Arc<InterpreterTracker>,
        artifact: &Path,
        event: &Event,
    ) -> mlua::Result<()> {
        let lua = &tracker.lua;

        let lib = self.config_dir.join("lib");
        let lib = lib.display();
        lua.load(format!(
            r#"package.path = package.path .. ";{lib}/?.lua;{lib}/?/init.lua""#
        ))
        .exec()?;

        for (global, module) in HELPER_PRELOADS {
            let loaded: bool = lua
                .load(format!(
                    r#"local ok, mod = pcall(require, "{module}")
                       if ok then {global} = mod end
                       return ok"#
                ))
                .eval()?;
            if !loaded {
                warn!(module = module, "Helper library not available");
            }
        }

        let dir = artifact.parent().unwrap_or_else(|| Path::new("."));
        lua.globals()
            .set("SCRIPT_DIR", dir.display().to_string())?;
        lua.globals()
            .set("SCRIPT_PATH", artifact.display().to_string())?;

        host::register(lua, self, tracker.id, artifact, event)
    }

    fn run_with_deadline<R>(
        &self,
        lua: &Lua,
        body: impl FnOnce() -> mlua::Result<R>,
    ) -> mlua::Result<R> {
        let deadline = Instant::now() + self.script_timeout;
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(DEADLINE_CHECK_INSTRUCTIONS),
            move |_lua, _debug| {
                if Instant::now() >= deadline {
                    Err(mlua::Error::RuntimeError(DEADLINE_MARKER.to_string()))
                } else {
                    Ok(mlua::VmState::Continue)
                }
            },
        );

        let result = body();
        lua.remove_hook();
        result
    }

    fn classify_error(&self, err: mlua::Error, artifact: Option<&Path>) -> ScriptError {
        if is_deadline(&err) {
            return ScriptError::Timeout(self.script_timeout);
        }
        match err {
            mlua::Error::SyntaxError { message, .. } => match artifact {
                Some(path) => ScriptError::Load {
                    path: path.to_path_buf(),
                    message,
                },
                None => ScriptError::Runtime(message),
            },
            other => ScriptError::Runtime(format_lua_error(&other)),
        }
    }
}

impl CallbackInvoker for ExecutorInner {
    fn invoke(&self, callback: CallbackHandle, owner: InterpreterId, timer_id: &str) {
        if let Err(e) = self.invoke_callback(callback, owner, timer_id) {
            match e {
                ScriptError::UnknownInterpreter(_) | ScriptError::UnknownCallback { .. } => {
                    debug!(timer = %timer_id, error = %e, "Callback skipped")
                }
                other => error!(timer = %timer_id, error = %other, "Timer callback failed"),
            }
        }
    }

    fn release(&self, callback: CallbackHandle, owner: InterpreterId, timer_id: &str) {
        self.release_timer(callback, owner, timer_id);
    }
}

fn is_deadline(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::RuntimeError(msg) => msg.contains(DEADLINE_MARKER),
        mlua::Error::CallbackError { cause, .. } => is_deadline(cause),
        _ => false,
    }
}

/// Flatten an mlua error into one line, unwrapping callback chains.
pub(crate) fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        other => other.to_string(),
    }
}
