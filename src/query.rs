//! Query packets, response packets and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::action::Action;
use crate::error::{ProtocolError, Result};
use crate::skyhash::types::{ResponseEntry, Value};

// ============================================================================
// Cancellation
// ============================================================================

/// A cancellation token shared between a caller and its packets.
///
/// Checked once, before a packet is written. An exchange already in flight is
/// not interrupted.
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Mark the token cancelled. Returns `false` if it already was.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Another handle to the same flag; cancelling either cancels both.
    pub fn share(&self) -> Self {
        self.clone()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Query Packet
// ============================================================================

/// An ordered batch of actions sent in one round trip.
#[derive(Debug, Default)]
pub struct QueryPacket {
    actions: Vec<Box<dyn Action>>,
    cancellation: Option<Cancellation>,
}

impl QueryPacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// A packet holding a single action.
    pub fn single(action: impl Action + 'static) -> Self {
        Self::new().push(action)
    }

    /// Append an action. Responses come back in push order.
    pub fn push(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn push_boxed(&mut self, action: Box<dyn Action>) {
        self.actions.push(action);
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn actions(&self) -> &[Box<dyn Action>] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
    }
}

// ============================================================================
// Response Packet
// ============================================================================

/// The entries of one batch, one per action in request order.
#[derive(Debug)]
pub struct ResponsePacket {
    entries: Vec<ResponseEntry>,
}

impl ResponsePacket {
    pub(crate) fn new(entries: Vec<ResponseEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ResponseEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<ResponseEntry> {
        self.entries
    }

    /// The value of each entry, or the first entry error.
    pub fn into_values(self) -> Result<Vec<Value>> {
        self.entries
            .into_iter()
            .map(ResponseEntry::into_result)
            .collect()
    }

    /// The first entry's result. Packets built from one action use this.
    pub(crate) fn into_first(self) -> Result<Value> {
        match self.entries.into_iter().next() {
            Some(entry) => entry.into_result(),
            None => Err(ProtocolError::EntryCountMismatch {
                expected: 1,
                actual: 0,
            }
            .into()),
        }
    }
}

impl IntoIterator for ResponsePacket {
    type Item = ResponseEntry;
    type IntoIter = std::vec::IntoIter<ResponseEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
