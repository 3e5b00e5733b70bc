use std::collections::HashMap;

/// Correlation id chosen by guest code for an asynchronous request.
pub type OpId = u32;

/// Result the host posts for a pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Resolve the guest promise with these bytes (delivered as a `Uint8Array`).
    Ok(Vec<u8>),
    /// Reject the guest promise with an `Error` carrying this message.
    Err(String),
}

/// In-flight operations awaiting a host completion.
pub(crate) struct PendingTable<T> {
    entries: HashMap<OpId, T>,
}

impl<T> PendingTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `value` under `id`. An id that is already in flight is
    /// rejected and the value handed back.
    pub(crate) fn register(&mut self, id: OpId, value: T) -> Result<(), T> {
        if self.entries.contains_key(&id) {
            return Err(value);
        }
        self.entries.insert(id, value);
        Ok(())
    }

    pub(crate) fn take(&mut self, id: OpId) -> Option<T> {
        self.entries.remove(&id)
    }

    pub(crate) fn contains(&self, id: OpId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry without completing it.
    pub(crate) fn abandon(&mut self) -> usize {
        let abandoned = self.entries.len();
        self.entries.clear();
        abandoned
    }
}
