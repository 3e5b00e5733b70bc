use std::{
    cell::RefCell,
    ffi::{CString, c_char},
};

thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, CString)>> = const { RefCell::new(None) };
}

/// Message of the last failed call on this thread, or null. Valid until the
/// next failing call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn corral_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |(_, message)| message.as_ptr())
    })
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Core(#[from] corral_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArgument = 1,
    Internal = 2,
    /// Guest code threw; see `corral_last_exception`.
    Exception = 3,
    Bootstrap = 4,
    Module = 5,
    State = 6,
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        use corral_core::Error as Core;

        match err {
            Error::InvalidArgument(_) => Self::InvalidArgument,
            Error::Core(Core::Guest(_)) => Self::Exception,
            Error::Core(Core::Bootstrap(_)) => Self::Bootstrap,
            Error::Core(
                Core::DuplicateModule { .. }
                | Core::RetiredModule(_)
                | Core::UnknownModule(_)
                | Core::Syntax { .. }
                | Core::Resolution { .. },
            ) => Self::Module,
            Error::Core(Core::State(_)) => Self::State,
            Error::Core(_) => Self::Internal,
        }
    }
}

fn to_cstring(message: String) -> CString {
    CString::new(message).unwrap_or_else(|_| c"error message contains a nul byte".to_owned())
}

pub fn set_last_error(err: Error) -> ErrorCode {
    let code = ErrorCode::from(&err);
    tracing::debug!(?code, %err, "c api call failed");
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some((code, to_cstring(err.to_string())));
    });
    code
}
