use core::fmt;

use crate::host::{Host, NoopHost};

const DEFAULT_MAX_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Options for [`crate::Isolate::new`].
pub struct IsolateConfig {
    pub(crate) snapshot: Option<Vec<u8>>,
    pub(crate) shared: Option<Vec<u8>>,
    pub(crate) host: Box<dyn Host>,
    pub(crate) will_snapshot: bool,
    pub(crate) max_stack_size: usize,
    pub(crate) memory_limit: Option<usize>,
    pub(crate) gc_threshold: Option<usize>,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            snapshot: None,
            shared: None,
            host: Box::new(NoopHost),
            will_snapshot: false,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            memory_limit: None,
            gc_threshold: None,
        }
    }
}

impl IsolateConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Heap-bootstrap blob produced by [`crate::Isolate::snapshot`]. Ignored by
    /// [`crate::Isolate::from_startup_data`], which uses the installed pair.
    #[must_use]
    pub fn snapshot(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.snapshot = Some(blob.into());
        self
    }

    /// Buffer exposed to guest code as `corral.shared`. The isolate takes
    /// ownership; the host reaches it through [`crate::Isolate::with_shared`].
    #[must_use]
    pub fn shared(mut self, buffer: Vec<u8>) -> Self {
        self.shared = Some(buffer);
        self
    }

    #[must_use]
    pub fn host(mut self, host: impl Host + 'static) -> Self {
        self.host = Box::new(host);
        self
    }

    /// Record registered modules and evaluated entries so that
    /// [`crate::Isolate::snapshot`] can be called.
    #[must_use]
    pub const fn will_snapshot(mut self, will_snapshot: bool) -> Self {
        self.will_snapshot = will_snapshot;
        self
    }

    #[must_use]
    pub const fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    #[must_use]
    pub const fn memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit = bytes;
        self
    }

    #[must_use]
    pub const fn gc_threshold(mut self, bytes: Option<usize>) -> Self {
        self.gc_threshold = bytes;
        self
    }
}

impl fmt::Debug for IsolateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateConfig")
            .field("snapshot", &self.snapshot.as_ref().map(Vec::len))
            .field("shared", &self.shared.as_ref().map(Vec::len))
            .field("will_snapshot", &self.will_snapshot)
            .field("max_stack_size", &self.max_stack_size)
            .field("memory_limit", &self.memory_limit)
            .field("gc_threshold", &self.gc_threshold)
            .finish_non_exhaustive()
    }
}
