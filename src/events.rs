use std::sync::{Mutex, MutexGuard};

use crate::types::PageEvents;

/// Buffers console output and page errors pushed by driver listeners.
///
/// Both buffers live behind one lock so a drain observes them at a single
/// instant: every record lands either before or after a given drain.
#[derive(Debug, Default)]
pub struct EventCollector {
    buffers: Mutex<PageEvents>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_console(&self, message: impl Into<String>) {
        self.lock().console.push(message.into());
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.lock().errors.push(message.into());
    }

    /// Returns everything collected so far and empties both buffers.
    pub fn get_and_clear(&self) -> PageEvents {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, PageEvents> {
        // A listener panicking mid-push leaves the vectors intact.
        self.buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
