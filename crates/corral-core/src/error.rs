use thiserror::Error;

use crate::{exception::ExceptionInfo, module::ModuleId};

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Natives or snapshot data could not be installed. The isolate being built
    /// is unusable; there is no partial recovery.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("module `{name}` is already registered as {existing}")]
    DuplicateModule { name: String, existing: ModuleId },

    /// The name belonged to a module dropped by a registry reset. The engine
    /// still holds that module instance, so the name cannot be bound again.
    #[error("module name `{0}` was used before the registry was cleared")]
    RetiredModule(String),

    #[error("unknown module {0}")]
    UnknownModule(ModuleId),

    #[error("failed to compile module `{name}`: {message}")]
    Syntax { name: String, message: String },

    #[error("cannot resolve `{specifier}` from `{referrer}`: {reason}")]
    Resolution {
        referrer: String,
        specifier: String,
        reason: String,
    },

    /// Uncaught guest exception. The same exception is stored in the isolate's
    /// last-exception slot.
    #[error("uncaught exception: {0}")]
    Guest(Box<ExceptionInfo>),

    #[error("engine error: {0}")]
    Engine(#[from] rquickjs::Error),

    #[error("invalid state: {0}")]
    State(&'static str),
}

impl Error {
    pub(crate) fn bootstrap(err: impl core::fmt::Display) -> Self {
        Self::Bootstrap(err.to_string())
    }
}
