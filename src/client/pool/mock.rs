use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::PoolableConnection;

/// A connection which only tracks whether it is open.
#[derive(Debug)]
pub(crate) struct MockConnection {
    pub(crate) id: usize,
    open: Arc<AtomicBool>,
}

impl MockConnection {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A handle which observes whether this connection is still open.
    pub(crate) fn handle(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }
}

impl PoolableConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
