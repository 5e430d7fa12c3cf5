//! Staggered racing of connection attempts, after RFC 8305 ("Happy Eyeballs").
//!
//! Attempts are started one at a time. When an attempt has neither succeeded
//! nor failed within the attempt delay, the next one is started alongside it.
//! A failure starts the next attempt immediately. The first attempt to
//! succeed wins and the rest are dropped.
//!
//! Attempts run concurrently inside the calling task; nothing is spawned.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt as _;
use tracing::trace;

/// Why a race produced no winner.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HappyEyeballsError<E> {
    /// There was nothing to attempt.
    NoProgress,

    /// Every attempt failed. This is the first failure.
    Error(E),
}

impl<E: fmt::Display> fmt::Display for HappyEyeballsError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoProgress => f.write_str("no attempts to make"),
            Self::Error(error) => write!(f, "all attempts failed: {error}"),
        }
    }
}

/// A set of attempts, raced with a delay between starts.
///
/// With no delay the attempts run strictly one after another. A zero delay
/// starts them all at once.
pub(crate) struct EyeballSet<F, T, E> {
    queue: VecDeque<F>,
    running: FuturesUnordered<F>,
    delay: Option<Duration>,
    error: Option<E>,
    result: PhantomData<fn() -> T>,
}

impl<F, T, E> fmt::Debug for EyeballSet<F, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EyeballSet")
            .field("queued", &self.queue.len())
            .field("running", &self.running.len())
            .field("delay", &self.delay)
            .finish()
    }
}

enum Eyeball<T> {
    Ok(T),
    Error,
    Waiting,
    Exhausted,
}

impl<F, T, E> EyeballSet<F, T, E>
where
    F: Future<Output = Result<T, E>>,
{
    pub(crate) fn new(delay: Option<Duration>) -> Self {
        Self {
            queue: VecDeque::new(),
            running: FuturesUnordered::new(),
            delay,
            error: None,
            result: PhantomData,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len() + self.running.len()
    }

    pub(crate) fn push(&mut self, attempt: F) {
        self.queue.push_back(attempt);
    }

    fn start_next(&mut self) {
        if let Some(attempt) = self.queue.pop_front() {
            trace!(remaining = self.queue.len(), "starting attempt");
            self.running.push(attempt);
        }
    }

    async fn join_next(&mut self) -> Eyeball<T> {
        match self.running.next().await {
            Some(Ok(output)) => Eyeball::Ok(output),
            Some(Err(error)) => {
                trace!("attempt failed");
                if self.error.is_none() {
                    self.error = Some(error);
                }
                Eyeball::Error
            }
            None => Eyeball::Exhausted,
        }
    }

    async fn join_next_within_delay(&mut self) -> Eyeball<T> {
        match self.delay {
            Some(delay) => tokio::time::timeout(delay, self.join_next())
                .await
                .unwrap_or(Eyeball::Waiting),
            None => self.join_next().await,
        }
    }

    /// Run the attempts, returning the first success.
    pub(crate) async fn finish(mut self) -> Result<T, HappyEyeballsError<E>> {
        self.start_next();

        while !self.queue.is_empty() {
            match self.join_next_within_delay().await {
                Eyeball::Ok(output) => return Ok(output),
                Eyeball::Error | Eyeball::Waiting | Eyeball::Exhausted => self.start_next(),
            }
        }

        loop {
            match self.join_next().await {
                Eyeball::Ok(output) => return Ok(output),
                Eyeball::Error | Eyeball::Waiting => continue,
                Eyeball::Exhausted => {
                    return Err(self
                        .error
                        .take()
                        .map(HappyEyeballsError::Error)
                        .unwrap_or(HappyEyeballsError::NoProgress))
                }
            }
        }
    }
}

impl<F, T, E> Extend<F> for EyeballSet<F, T, E> {
    fn extend<I: IntoIterator<Item = F>>(&mut self, iter: I) {
        self.queue.extend(iter);
    }
}
