//! Event router
//!
//! Maps each event to an ordered list of script artifacts via the
//! directory tree under `<config>/events/`, then submits one task per
//! artifact to the worker pool. The router never reads script contents
//! and a missing directory simply yields no work.
//!
//! ```text
//! events/
//!   device/<id>/<attr>/*.lua    attribute-change handlers
//!   device/<id>/*.lua           handlers for events with no attribute
//!   bus/<topic-path>/*.lua      raw-topic handlers
//!   time/<pattern>/*.lua        time-event handlers
//!   state/<key>/*.lua           state-change handlers
//! ```

use luma_core::{Event, EventSink, EventSource};
use luma_script::{Task, WorkerPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The event router.
pub struct EventRouter {
    events_dir: PathBuf,
    pool: Arc<WorkerPool>,
}

impl EventRouter {
    /// `config_dir` is the configuration root holding the `events/` tree.
    pub fn new(config_dir: impl Into<PathBuf>, pool: Arc<WorkerPool>) -> Self {
        Self {
            events_dir: config_dir.into().join("events"),
            pool,
        }
    }

    /// Resolve an event to its artifact paths, in directory-entry order.
    pub fn resolve(&self, event: &Event) -> Vec<PathBuf> {
        let dir = match event.source {
            EventSource::Device => {
                let Some(device) = &event.device else {
                    return Vec::new();
                };
                let device_dir = self.events_dir.join("device").join(device);
                match &event.attribute {
                    // With an attribute, only that attribute's directory;
                    // the generic one would double-run handlers.
                    Some(attribute) => device_dir.join(attribute),
                    None => device_dir,
                }
            }
            EventSource::Bus => {
                let Some(topic) = &event.topic else {
                    return Vec::new();
                };
                topic
                    .split('/')
                    .fold(self.events_dir.join("bus"), |dir, part| dir.join(part))
            }
            EventSource::Time => self.events_dir.join("time").join(&event.event_type),
            EventSource::State => {
                let Some(attribute) = &event.attribute else {
                    return Vec::new();
                };
                self.events_dir.join("state").join(attribute)
            }
            // Timer fires and action invocations go straight through the
            // executor, never the tree.
            EventSource::Timer | EventSource::Action => return Vec::new(),
        };

        lua_files(&dir)
    }
}

impl EventSink for EventRouter {
    fn dispatch(&self, event: Event) {
        let artifacts = self.resolve(&event);
        if artifacts.is_empty() {
            debug!(
                source = %event.source,
                event_type = %event.event_type,
                device = event.device.as_deref().unwrap_or(""),
                "No scripts for event"
            );
            return;
        }

        debug!(
            source = %event.source,
            event_type = %event.event_type,
            count = artifacts.len(),
            "Routing event"
        );
        for artifact in artifacts {
            self.pool.submit(Task {
                artifact,
                event: event.clone(),
            });
        }
    }
}

/// The `*.lua` files directly under `dir`, in directory-entry order.
fn lua_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "lua"))
        .collect()
}
