//! Per-phase request deadlines.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Phase;
use crate::Error;

/// Timeouts applied while executing a request.
///
/// Each phase timeout is further capped by `total`, which covers the whole
/// request: every redirect hop and reading the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Timeouts {
    /// Deadline for the whole request, including the response body.
    pub total: Option<Duration>,

    /// Time allowed to establish a new connection (resolve, connect, handshake).
    pub connect: Option<Duration>,

    /// Time allowed to write the request head and body.
    pub write: Option<Duration>,

    /// Time allowed between finishing the request and receiving the response head.
    pub head: Option<Duration>,

    /// Time allowed for each chunk of the response body to arrive.
    pub body_chunk: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            total: Some(Duration::from_secs(60)),
            connect: Some(Duration::from_secs(10)),
            write: None,
            head: None,
            body_chunk: None,
        }
    }
}

impl Timeouts {
    /// No timeouts at all.
    pub fn none() -> Self {
        Self {
            total: None,
            connect: None,
            write: None,
            head: None,
            body_chunk: None,
        }
    }
}

/// The time and cancellation budget of one request.
///
/// Created when a request starts, and carried into its response body.
#[derive(Debug, Clone)]
pub(crate) struct Budget {
    timeouts: Timeouts,
    overall: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Budget {
    pub(crate) fn new(timeouts: Timeouts, cancel: Option<CancellationToken>) -> Self {
        Self {
            overall: timeouts.total.map(|total| Instant::now() + total),
            timeouts,
            cancel,
        }
    }

    pub(crate) fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// The earlier of `now + limit` and the overall deadline.
    pub(crate) fn deadline(&self, limit: Option<Duration>) -> Option<Instant> {
        let phase = limit.map(|limit| Instant::now() + limit);
        match (phase, self.overall) {
            (Some(phase), Some(overall)) => Some(phase.min(overall)),
            (phase, overall) => phase.or(overall),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Run `future` for `phase`, bounded by `limit` and the overall deadline.
    ///
    /// Fails with [`Error::Timeout`] when the deadline passes and with
    /// [`Error::Cancelled`] when the request is cancelled. `future` is dropped
    /// in both cases.
    pub(crate) async fn run<F>(
        &self,
        phase: Phase,
        limit: Option<Duration>,
        future: F,
    ) -> Result<F::Output, Error>
    where
        F: Future,
    {
        let deadline = self.deadline(limit);
        let bounded = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, future)
                    .await
                    .map_err(|_| Error::Timeout(phase)),
                None => Ok(future.await),
            }
        };

        match &self.cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }
}
