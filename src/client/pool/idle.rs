use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::PoolableConnection;

#[derive(Debug)]
struct Idle<T> {
    at: Instant,
    inner: T,
}

impl<T> Idle<T> {
    fn new(inner: T) -> Self {
        Self {
            at: Instant::now(),
            inner,
        }
    }
}

/// Idle connections for a single origin.
///
/// Kept as a stack: the most recently released connection is on top,
/// the oldest at the bottom. Release times therefore never decrease
/// from bottom to top.
#[derive(Debug)]
pub(super) struct IdleConnections<T> {
    inner: Vec<Idle<T>>,
}

impl<T> Default for IdleConnections<T> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<T> IdleConnections<T>
where
    T: PoolableConnection,
{
    pub(super) fn push(&mut self, inner: T) {
        self.inner.push(Idle::new(inner));
    }

    /// Pop the most recently released connection which is still open.
    ///
    /// Closed connections found on the way are moved to `discard`.
    pub(super) fn pop(&mut self, discard: &mut Vec<T>) -> Option<T> {
        while let Some(entry) = self.inner.pop() {
            if entry.inner.is_open() {
                trace!("found idle connection");
                return Some(entry.inner);
            }

            trace!("found closed connection");
            discard.push(entry.inner);
        }
        None
    }

    /// Remove the least recently released connection.
    pub(super) fn pop_oldest(&mut self) -> Option<T> {
        if self.inner.is_empty() {
            None
        } else {
            Some(self.inner.remove(0).inner)
        }
    }

    /// Move connections idle for longer than `timeout`, or already closed, to `discard`.
    pub(super) fn evict(&mut self, timeout: Option<Duration>, discard: &mut Vec<T>) {
        if let Some(expired) = timeout.and_then(|timeout| Instant::now().checked_sub(timeout)) {
            let fresh = self.inner.partition_point(|entry| entry.at <= expired);
            if fresh > 0 {
                trace!(count = fresh, "evicting expired connections");
                discard.extend(self.inner.drain(..fresh).map(|entry| entry.inner));
            }
        }

        if self.inner.iter().any(|entry| !entry.inner.is_open()) {
            let entries = std::mem::take(&mut self.inner);
            for entry in entries {
                if entry.inner.is_open() {
                    self.inner.push(entry);
                } else {
                    trace!("evicting closed connection");
                    discard.push(entry.inner);
                }
            }
        }
    }

    /// Remove every connection.
    pub(super) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.inner.drain(..).map(|entry| entry.inner)
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
