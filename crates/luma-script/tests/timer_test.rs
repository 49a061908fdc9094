//! Timer callbacks through a running scheduler
//!
//! These tests start the real tick loop and wait for fires, so they take
//! a few seconds each.

mod common;

use common::{Harness, NoopSink};
use luma_core::Value;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn auto_off_timer_fires_and_interpreter_closes() {
    let h = Harness::new();
    h.scheduler.start(Arc::new(NoopSink));

    let script = h.write_script(
        "events/device/porch/state/on_change.lua",
        r#"if event.data.state == "ON" then
               timer.after(1, "off", function()
                   device.set("porch", {state = "OFF"})
               end)
           end"#,
    );
    let event = h.device_event("state", "ON");
    let executor = h.executor.clone();
    tokio::task::spawn_blocking(move || executor.execute(&script, &event))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.executor.live_interpreters(), 1);
    assert_eq!(h.scheduler.list(), vec!["off"]);

    tokio::time::sleep(Duration::from_millis(2600)).await;

    let published = h.bus.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1, "expected exactly one OFF publish");
    assert_eq!(published[0].0, "zigbee2mqtt/Porch/set");
    let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
    assert_eq!(body, serde_json::json!({"state": "OFF"}));

    assert!(h.scheduler.list().is_empty());
    assert_eq!(h.executor.live_interpreters(), 0);

    h.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_timers_share_one_interpreter_sequentially() {
    let h = Harness::new();
    h.scheduler.start(Arc::new(NoopSink));

    let script = h.write_script(
        "events/device/porch/state/counter.lua",
        r#"local count = 0
           local function bump()
               count = count + 1
               state.set("count", count)
           end
           timer.after(1, "a", bump)
           timer.after(1, "b", bump)"#,
    );
    let event = h.device_event("state", "ON");
    let executor = h.executor.clone();
    tokio::task::spawn_blocking(move || executor.execute(&script, &event))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.executor.live_interpreters(), 1);

    tokio::time::sleep(Duration::from_millis(2600)).await;

    // Both closures saw the same upvalue with no interleaving artefact.
    assert_eq!(h.store.get("count").unwrap(), Value::Int(2));
    assert!(h.scheduler.list().is_empty());
    assert_eq!(h.executor.live_interpreters(), 0);

    h.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recurring_timer_survives_fires_until_cancelled() {
    let h = Harness::new();
    h.scheduler.start(Arc::new(NoopSink));

    let script = h.write_script(
        "events/device/porch/state/heartbeat.lua",
        r#"timer.every(1, "tick", function()
               local n = state.get("ticks") or 0
               state.set("ticks", n + 1)
           end)"#,
    );
    let event = h.device_event("state", "ON");
    let executor = h.executor.clone();
    tokio::task::spawn_blocking(move || executor.execute(&script, &event))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3600)).await;

    let ticks = h.store.get("ticks").unwrap();
    let Value::Int(n) = ticks else {
        panic!("expected integer tick count, got {ticks:?}")
    };
    assert!(n >= 2, "expected at least two fires, saw {n}");

    // Still armed, interpreter still alive.
    assert_eq!(h.scheduler.list(), vec!["tick"]);
    assert_eq!(h.executor.live_interpreters(), 1);

    assert!(h.scheduler.remove("tick"));
    assert_eq!(h.executor.live_interpreters(), 0);

    h.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_gets_its_own_deadline() {
    let h = Harness::with_script_timeout(Some(Duration::from_millis(300)));
    let executor = h.executor.clone();
    h.scheduler.start(Arc::new(NoopSink));

    // The callback spins past its deadline; the interpreter must still be
    // reclaimed after the aborted fire.
    let script = h.write_script(
        "events/device/porch/state/slow_cb.lua",
        r#"timer.after(1, "slow", function()
               state.set("entered", true)
               while true do end
           end)"#,
    );
    let event = h.device_event("state", "ON");
    {
        let executor = executor.clone();
        tokio::task::spawn_blocking(move || executor.execute(&script, &event))
            .await
            .unwrap()
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(3000)).await;

    assert_eq!(h.store.get("entered").unwrap(), Value::Bool(true));
    assert!(h.scheduler.list().is_empty());
    assert_eq!(executor.live_interpreters(), 0);

    h.scheduler.stop().await;
}
