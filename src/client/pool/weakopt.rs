use std::fmt;
use std::sync::{Arc, Weak};

use crate::DebugLiteral;

/// A weak reference which may also be empty.
///
/// Slots and connections hold one of these to get back to their pool
/// without keeping the pool alive.
pub(super) struct WeakOpt<T>(Option<Weak<T>>);

impl<T> WeakOpt<T> {
    #[cfg(test)]
    pub(super) fn none() -> Self {
        Self(None)
    }

    pub(super) fn downgrade(arc: &Arc<T>) -> Self {
        Self(Some(Arc::downgrade(arc)))
    }

    pub(super) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.as_ref().and_then(Weak::upgrade)
    }
}

impl<T> Clone for WeakOpt<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for WeakOpt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.upgrade().is_some() {
            "Live"
        } else {
            "Gone"
        };
        f.debug_tuple("WeakOpt").field(&DebugLiteral(state)).finish()
    }
}
