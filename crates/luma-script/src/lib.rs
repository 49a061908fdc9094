//! Lua script execution
//!
//! This crate runs user-authored automation scripts: the worker pool that
//! takes `(artifact, event)` tasks off a bounded queue, the executor that
//! creates interpreters and manages their lifetimes, and the host API
//! surface (`state.*`, `device.*`, `log.*`, `timer.*`, `udp.*`,
//! `script.*`) bound into every interpreter.
//!
//! Interpreter lifetime follows a borrow model: the initial script
//! execution is one borrow and every outstanding timer is another. The
//! interpreter is torn down exactly when no borrows remain, so a closure
//! registered with the scheduler always finds its upvalues alive.

mod convert;
mod executor;
mod host;
mod pool;

pub use convert::{from_lua, to_lua};
pub use executor::ScriptExecutor;
pub use pool::{Task, WorkerPool};

use luma_scheduler::InterpreterId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for script execution
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Errors raised while loading or running a script
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script not found: {path}")]
    MissingArtifact { path: PathBuf },

    #[error("failed to load {path}: {message}")]
    Load { path: PathBuf, message: String },

    #[error("script error: {0}")]
    Runtime(String),

    #[error("script exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("interpreter {0} is not tracked")]
    UnknownInterpreter(InterpreterId),

    #[error("no retained callback for timer {timer}")]
    UnknownCallback { timer: String },
}
