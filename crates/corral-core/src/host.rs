use core::ffi::c_void;

use crate::{TRACE_TARGET_SCRIPT, buffer::PinnedBuf};

/// Opaque embedder pointer attached to the isolate for the duration of one
/// call into guest code and handed back to every host callback made during
/// that call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(*mut c_void);

impl UserData {
    pub const NONE: Self = Self(core::ptr::null_mut());

    #[must_use]
    pub const fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    #[must_use]
    pub const fn as_ptr(self) -> *mut c_void {
        self.0
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0.is_null()
    }
}

impl Default for UserData {
    fn default() -> Self {
        Self::NONE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A message sent by guest code through `corral.send`.
#[derive(Debug)]
pub struct Message<'a> {
    /// Control bytes, borrowed from the guest view for the duration of the call.
    pub control: &'a [u8],
    /// Optional zero-copy payload. It stays pinned until the host releases it
    /// with [`crate::Isolate::detach_buffer`].
    pub zero_copy: Option<PinnedBuf>,
}

/// Host side of the call bridge.
pub trait Host {
    /// Called synchronously for every `corral.send`. A returned buffer becomes
    /// the return value of `send` inside guest code.
    fn recv(&mut self, user_data: UserData, message: Message<'_>) -> Option<Vec<u8>>;

    /// Sink for `corral.print` and `console.*`.
    fn print(&mut self, level: PrintLevel, message: &str) {
        match level {
            PrintLevel::Debug => tracing::debug!(target: TRACE_TARGET_SCRIPT, "{message}"),
            PrintLevel::Info => tracing::info!(target: TRACE_TARGET_SCRIPT, "{message}"),
            PrintLevel::Warn => tracing::warn!(target: TRACE_TARGET_SCRIPT, "{message}"),
            PrintLevel::Error => tracing::error!(target: TRACE_TARGET_SCRIPT, "{message}"),
        }
    }
}

/// Host that drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl Host for NoopHost {
    fn recv(&mut self, _user_data: UserData, message: Message<'_>) -> Option<Vec<u8>> {
        tracing::debug!(len = message.control.len(), "message dropped by noop host");
        None
    }
}
