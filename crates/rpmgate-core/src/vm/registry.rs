use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::{SessionError, SessionResult};

/// Process-wide set of live session names.
///
/// A name is a resource token: acquiring one that is held fails at once with
/// `AlreadyRunning` instead of waiting.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    live: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn names(&self) -> MutexGuard<'_, HashSet<String>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `name` for the lifetime of the returned lease.
    pub fn acquire(&self, name: &str) -> SessionResult<NameLease> {
        if !self.names().insert(name.to_string()) {
            return Err(SessionError::AlreadyRunning {
                name: name.to_string(),
            });
        }
        Ok(NameLease {
            name: name.to_string(),
            live: Arc::clone(&self.live),
        })
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.names().contains(name)
    }

    pub fn live_count(&self) -> usize {
        self.names().len()
    }
}

/// Holds a session name; releases it on drop.
#[derive(Debug)]
pub struct NameLease {
    name: String,
    live: Arc<Mutex<HashSet<String>>>,
}

impl NameLease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameLease {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}
