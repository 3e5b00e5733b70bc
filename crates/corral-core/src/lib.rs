//! Embedding layer for a QuickJS execution context.
//!
//! An [`Isolate`] owns one engine context together with everything that
//! references into it from the host side: the module registry, pinned
//! zero-copy buffers, pending asynchronous operations and the last uncaught
//! exception. Guest code reaches the host through the `corral` global
//! installed by the bridge.

pub mod bridge;
mod buffer;
mod config;
mod error;
mod exception;
mod host;
mod imports;
mod isolate;
mod module;
mod pending;
pub mod snapshot;

pub use buffer::{BufferId, PinnedBuf};
pub use config::IsolateConfig;
pub use error::{Error, Result};
pub use exception::{ExceptionInfo, StackFrame};
pub use host::{Host, Message, NoopHost, PrintLevel, UserData};
pub use isolate::{Isolate, TerminationHandle, UserDataScope};
pub use module::{ModuleId, ModuleResolver, ModuleState, Resolution};
pub use pending::{Completion, OpId};
pub use snapshot::{StartupData, compile_natives, install_startup_data};

/// Target of `tracing` events carrying guest output.
pub const TRACE_TARGET_SCRIPT: &str = "corral::script";
