//! Host API bound into every interpreter
//!
//! Scripts run with full host trust and see:
//! `event` (read-only view of the triggering event), `state.*` (persistent
//! KV store), `device.*` (registry reads, command publishes, action
//! scripts), `log.*`, `timer.*` (scheduler-backed callbacks), `udp.send`
//! and `script.run_siblings`.

use crate::convert::{from_lua, to_lua};
use crate::executor::ExecutorInner;
use chrono::Local;
use luma_core::{Event, EventSource, Value};
use luma_scheduler::InterpreterId;
use luma_store::StoreError;
use mlua::Lua;
use std::collections::HashMap;
use std::net::UdpSocket;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub(crate) fn register(
    lua: &Lua,
    inner: &Arc<ExecutorInner>,
    owner: InterpreterId,
    artifact: &Path,
    event: &Event,
) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.set("event", event_table(lua, event)?)?;
    globals.set("state", state_table(lua, inner)?)?;
    globals.set("device", device_table(lua, inner)?)?;
    globals.set("log", log_table(lua)?)?;
    globals.set("timer", timer_table(lua, inner, owner)?)?;
    globals.set("udp", udp_table(lua)?)?;
    globals.set("script", script_table(lua, inner, artifact, event)?)?;
    Ok(())
}

fn event_table(lua: &Lua, event: &Event) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;
    table.set("source", event.source.as_str())?;
    table.set("type", event.event_type.as_str())?;
    if let Some(device) = &event.device {
        table.set("device", device.as_str())?;
    }
    if let Some(attribute) = &event.attribute {
        table.set("attribute", attribute.as_str())?;
    }
    if let Some(topic) = &event.topic {
        table.set("topic", topic.as_str())?;
    }

    let data = lua.create_table()?;
    for (key, value) in &event.data {
        data.set(key.as_str(), to_lua(lua, value)?)?;
    }
    table.set("data", data)?;
    Ok(table)
}

fn state_table(lua: &Lua, inner: &Arc<ExecutorInner>) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;

    let get_inner = inner.clone();
    table.set(
        "get",
        lua.create_function(move |lua, key: String| match get_inner.store.get(&key) {
            Ok(value) => to_lua(lua, &value),
            Err(StoreError::NotFound { .. }) => Ok(mlua::Value::Nil),
            Err(e) => {
                error!(key = %key, error = %e, "State read failed");
                Ok(mlua::Value::Nil)
            }
        })?,
    )?;

    let set_inner = inner.clone();
    table.set(
        "set",
        lua.create_function(move |_, (key, value): (String, mlua::Value)| {
            let value = from_lua(&value);
            match set_inner.store.set(&key, &value) {
                Ok(()) => {
                    if let Some(sink) = set_inner.events.get() {
                        sink.dispatch(
                            Event::new(EventSource::State, "state_change")
                                .with_attribute(key.clone())
                                .with_data(HashMap::from([(key, value)])),
                        );
                    }
                }
                Err(e) => error!(key = %key, error = %e, "State write failed"),
            }
            Ok(())
        })?,
    )?;

    let delete_inner = inner.clone();
    table.set(
        "delete",
        lua.create_function(move |_, key: String| {
            if let Err(e) = delete_inner.store.delete(&key) {
                error!(key = %key, error = %e, "State delete failed");
            }
            Ok(())
        })?,
    )?;

    Ok(table)
}

fn device_table(lua: &Lua, inner: &Arc<ExecutorInner>) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;

    let get_inner = inner.clone();
    table.set(
        "get",
        lua.create_function(move |lua, id: String| match get_inner.registry.get(&id) {
            Ok(snapshot) => to_lua(lua, &Value::Map(snapshot)),
            Err(e) => {
                error!(device = %id, error = %e, "Device read failed");
                Ok(mlua::Value::Nil)
            }
        })?,
    )?;

    let set_inner = inner.clone();
    table.set(
        "set",
        lua.create_function(move |_, (id, attrs): (String, mlua::Table)| {
            let attrs = table_to_attrs(&attrs);
            if let Err(e) = set_inner.registry.set(&id, &attrs) {
                error!(device = %id, error = %e, "Device command failed");
            }
            Ok(())
        })?,
    )?;

    let call_inner = inner.clone();
    table.set(
        "call",
        lua.create_function(
            move |_, (id, action, params): (String, String, Option<mlua::Table>)| {
                let params = params.map(|t| table_to_attrs(&t)).unwrap_or_default();

                let script = call_inner
                    .config_dir
                    .join("events")
                    .join("device")
                    .join(&id)
                    .join("actions")
                    .join(format!("{action}.lua"));
                if !script.is_file() {
                    error!(device = %id, action = %action, "Action script not found");
                    return Ok(false);
                }

                let event = Event::new(EventSource::Action, "call")
                    .with_device(id.clone())
                    .with_attribute(action.clone())
                    .with_data(params);

                match call_inner.execute(&script, &event) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        error!(device = %id, action = %action, error = %e, "Action failed");
                        Ok(false)
                    }
                }
            },
        )?,
    )?;

    Ok(table)
}

fn log_table(lua: &Lua) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;
    table.set(
        "info",
        lua.create_function(|_, msg: String| {
            info!(target: "script", "{msg}");
            Ok(())
        })?,
    )?;
    table.set(
        "warn",
        lua.create_function(|_, msg: String| {
            warn!(target: "script", "{msg}");
            Ok(())
        })?,
    )?;
    table.set(
        "error",
        lua.create_function(|_, msg: String| {
            error!(target: "script", "{msg}");
            Ok(())
        })?,
    )?;
    Ok(table)
}

fn timer_table(
    lua: &Lua,
    inner: &Arc<ExecutorInner>,
    owner: InterpreterId,
) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;

    let after_inner = inner.clone();
    table.set(
        "after",
        lua.create_function(
            move |lua, (seconds, a, b): (f64, mlua::Value, Option<mlua::Value>)| {
                let Some(scheduler) = after_inner.scheduler.get() else {
                    warn!("Scheduler not available for timer.after");
                    return Ok(mlua::Value::Nil);
                };
                let (id, func) = match timer_args(a, b)? {
                    Some(parsed) => parsed,
                    None => return Ok(mlua::Value::Nil),
                };

                let handle = after_inner.register_callback(owner, func)?;
                let trigger =
                    Local::now() + chrono::Duration::milliseconds((seconds * 1000.0) as i64);
                scheduler.add_timer(&id, trigger, handle, owner);
                Ok(mlua::Value::String(lua.create_string(&id)?))
            },
        )?,
    )?;

    let at_inner = inner.clone();
    table.set(
        "at",
        lua.create_function(
            move |lua, (time, a, b): (String, mlua::Value, Option<mlua::Value>)| {
                let Some(scheduler) = at_inner.scheduler.get() else {
                    warn!("Scheduler not available for timer.at");
                    return Ok(mlua::Value::Nil);
                };
                let Some(trigger) = parse_clock_time(&time) else {
                    error!(time = %time, "Invalid time format, expected HH:MM");
                    return Ok(mlua::Value::Nil);
                };
                let (id, func) = match timer_args(a, b)? {
                    Some(parsed) => parsed,
                    None => return Ok(mlua::Value::Nil),
                };

                let handle = at_inner.register_callback(owner, func)?;
                scheduler.add_timer(&id, trigger, handle, owner);
                Ok(mlua::Value::String(lua.create_string(&id)?))
            },
        )?,
    )?;

    let every_inner = inner.clone();
    table.set(
        "every",
        lua.create_function(
            move |lua, (seconds, a, b): (f64, mlua::Value, Option<mlua::Value>)| {
                let Some(scheduler) = every_inner.scheduler.get() else {
                    warn!("Scheduler not available for timer.every");
                    return Ok(mlua::Value::Nil);
                };
                let (id, func) = match timer_args(a, b)? {
                    Some(parsed) => parsed,
                    None => return Ok(mlua::Value::Nil),
                };

                let handle = every_inner.register_callback(owner, func)?;
                scheduler.add_recurring(&id, Duration::from_secs_f64(seconds), handle, owner);
                Ok(mlua::Value::String(lua.create_string(&id)?))
            },
        )?,
    )?;

    let cancel_inner = inner.clone();
    table.set(
        "cancel",
        lua.create_function(move |_, id: String| {
            match cancel_inner.scheduler.get() {
                Some(scheduler) => Ok(scheduler.remove(&id)),
                None => {
                    warn!("Scheduler not available for timer.cancel");
                    Ok(false)
                }
            }
        })?,
    )?;

    let list_inner = inner.clone();
    table.set(
        "list",
        lua.create_function(move |lua, ()| {
            let table = lua.create_table()?;
            if let Some(scheduler) = list_inner.scheduler.get() {
                for (i, id) in scheduler.list().into_iter().enumerate() {
                    table.set(i + 1, id)?;
                }
            }
            Ok(table)
        })?,
    )?;

    Ok(table)
}

fn udp_table(lua: &Lua) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;
    table.set(
        "send",
        lua.create_function(
            |_, (message, host, port): (mlua::String, Option<String>, Option<u16>)| {
                let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
                let port = port.unwrap_or(8125);

                let socket = match UdpSocket::bind(("0.0.0.0", 0)) {
                    Ok(socket) => socket,
                    Err(e) => return Ok((false, Some(format!("bind error: {e}")))),
                };
                match socket.send_to(&message.as_bytes(), (host.as_str(), port)) {
                    Ok(_) => Ok((true, None)),
                    Err(e) => Ok((false, Some(format!("send error: {e}")))),
                }
            },
        )?,
    )?;
    Ok(table)
}

fn script_table(
    lua: &Lua,
    inner: &Arc<ExecutorInner>,
    artifact: &Path,
    event: &Event,
) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;

    let siblings_inner = inner.clone();
    let current = artifact.to_path_buf();
    let event = event.clone();
    table.set(
        "run_siblings",
        lua.create_function(move |_, ()| {
            let Some(dir) = current.parent() else {
                return Ok(0i64);
            };
            let Ok(entries) = std::fs::read_dir(dir) else {
                error!(dir = %dir.display(), "run_siblings failed to read directory");
                return Ok(0i64);
            };

            let mut executed = 0i64;
            let mut paths: Vec<_> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file()
                        && p.extension().is_some_and(|ext| ext == "lua")
                        && p != &current
                })
                .collect();
            paths.sort();

            for path in paths {
                debug!(sibling = %path.display(), "Running sibling script");
                match siblings_inner.execute(&path, &event) {
                    Ok(()) => executed += 1,
                    Err(e) => error!(sibling = %path.display(), error = %e, "Sibling failed"),
                }
            }
            Ok(executed)
        })?,
    )?;

    Ok(table)
}

/// Decode the `([id,] callback)` tail shared by the timer constructors.
/// Returns `None` (after logging) when the arguments make no sense.
fn timer_args(
    a: mlua::Value,
    b: Option<mlua::Value>,
) -> mlua::Result<Option<(String, mlua::Function)>> {
    match (a, b) {
        (mlua::Value::String(id), Some(mlua::Value::Function(func))) => {
            Ok(Some((id.to_str()?.to_string(), func)))
        }
        (mlua::Value::Function(func), None) | (mlua::Value::Function(func), Some(mlua::Value::Nil)) => {
            Ok(Some((auto_timer_id(), func)))
        }
        _ => {
            error!("Timer expects (id, callback) or (callback)");
            Ok(None)
        }
    }
}

fn auto_timer_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("timer_{nanos}")
}

/// Resolve `HH:MM` to the next occurrence: today, or tomorrow when the
/// time already passed.
fn parse_clock_time(time: &str) -> Option<chrono::DateTime<Local>> {
    let (hour, minute) = time.split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;

    let now = Local::now();
    let today = now.date_naive().and_hms_opt(hour, minute, 0)?;
    let trigger = today
        .and_local_timezone(Local)
        .single()
        .or_else(|| (today + chrono::Duration::hours(1)).and_local_timezone(Local).single())?;

    if trigger <= now {
        Some(trigger + chrono::Duration::days(1))
    } else {
        Some(trigger)
    }
}

fn table_to_attrs(table: &mlua::Table) -> HashMap<String, Value> {
    let mut attrs = HashMap::new();
    for pair in table.clone().pairs::<mlua::Value, mlua::Value>().flatten() {
        let (key, value) = pair;
        if let mlua::Value::String(key) = key {
            if let Ok(key) = key.to_str() {
                attrs.insert(key.to_string(), from_lua(&value));
            }
        }
    }
    attrs
}
