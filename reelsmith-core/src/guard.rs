use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Set of prefixes currently being processed by one channel.
///
/// Membership is taken with [`InFlightGuard::try_acquire`] and given back when
/// the returned permit is dropped, so every exit path of a unit of work
/// (success, error, panic, cancellation) releases it.
#[derive(Clone, Default)]
pub struct InFlightGuard {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("in_flight", &self.snapshot())
            .finish()
    }
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, prefix: &str) -> Option<InFlightPermit> {
        let mut set = self.inner.lock().expect("in-flight guard poisoned");
        if !set.insert(prefix.to_string()) {
            debug!(prefix, "prefix already in flight");
            return None;
        }
        Some(InFlightPermit {
            guard: self.clone(),
            prefix: prefix.to_string(),
        })
    }

    /// Removes `prefix`; returns whether it was held. Calling it twice is harmless.
    pub fn release(&self, prefix: &str) -> bool {
        self.inner
            .lock()
            .expect("in-flight guard poisoned")
            .remove(prefix)
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.inner
            .lock()
            .expect("in-flight guard poisoned")
            .contains(prefix)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("in-flight guard poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .inner
            .lock()
            .expect("in-flight guard poisoned")
            .iter()
            .cloned()
            .collect();
        prefixes.sort();
        prefixes
    }
}

#[derive(Debug)]
pub struct InFlightPermit {
    guard: InFlightGuard,
    prefix: String,
}

impl InFlightPermit {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        // A poisoned set still has to let go of the prefix.
        let mut set = match self.guard.inner.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.prefix);
    }
}
