//! De-duplicated user-facing warnings.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Use of a deprecated configuration alias.
///
/// Non-fatal: the deprecated value has already been mapped onto the
/// canonical option by the time this is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompatibilityWarning {
    /// The deprecated option name that was used.
    pub option: String,
    /// Human readable message.
    pub message: String,
}

impl fmt::Display for CompatibilityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Default)]
struct Seen {
    keys: HashSet<String>,
    order: Vec<String>,
}

/// Emits each distinct warning message at most once.
///
/// Cloning shares the underlying record, so a trainer and the policies it
/// hands the cache to all de-duplicate against the same set.
#[derive(Clone, Default)]
pub struct WarningCache {
    inner: Arc<Mutex<Seen>>,
}

impl WarningCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `message` through `tracing` unless it was emitted before.
    ///
    /// Returns `true` if the message was emitted by this call.
    pub fn warn(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut seen = self.inner.lock();
        if !seen.keys.insert(message.clone()) {
            return false;
        }
        tracing::warn!("{}", message);
        seen.order.push(message);
        true
    }

    /// Emit a compatibility warning once.
    pub fn compat(&self, warning: &CompatibilityWarning) -> bool {
        self.warn(warning.message.clone())
    }

    /// All messages emitted so far, in emission order.
    pub fn emitted(&self) -> Vec<String> {
        self.inner.lock().order.clone()
    }

    /// Number of distinct messages emitted.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for WarningCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarningCache")
            .field("emitted", &self.len())
            .finish()
    }
}
