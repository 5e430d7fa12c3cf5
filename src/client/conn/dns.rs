//! DNS resolution utilities.
//!
//! Resolvers implement [`Resolve`], turning a host and port into a list of
//! socket addresses. [`GaiResolver`] asks the operating system via
//! `getaddrinfo` on tokio's blocking pool, [`CachingResolver`] remembers answers
//! from another resolver for a while and supports static overrides, and
//! [`HostsResolver`] answers from a hosts file before asking another resolver.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use std::{fmt, io};

use futures_util::FutureExt as _;
use parking_lot::Mutex;
use pin_project::{pin_project, pinned_drop};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::BoxFuture;

/// A list of socket addresses, in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketAddrs(Vec<SocketAddr>);

impl SocketAddrs {
    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Are there no addresses?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the addresses in order.
    pub fn iter(&self) -> std::slice::Iter<'_, SocketAddr> {
        self.0.iter()
    }

    /// Move `addr` to the front, if present.
    pub fn prefer(&mut self, addr: &SocketAddr) {
        if let Some(index) = self.0.iter().position(|candidate| candidate == addr) {
            let preferred = self.0.remove(index);
            self.0.insert(0, preferred);
        }
    }

    /// Alternate IPv6 and IPv4 addresses, starting with the family of the
    /// first address. Order within a family is kept.
    pub fn interleave_families(&mut self) {
        let Some(first) = self.0.first() else {
            return;
        };
        let first_v6 = first.is_ipv6();
        let (mut primary, mut secondary): (VecDeque<_>, VecDeque<_>) =
            self.0.drain(..).partition(|addr| addr.is_ipv6() == first_v6);

        while !primary.is_empty() || !secondary.is_empty() {
            self.0.extend(primary.pop_front());
            self.0.extend(secondary.pop_front());
        }
    }

    /// Set the port on every address.
    pub fn set_port(&mut self, port: u16) {
        for addr in &mut self.0 {
            addr.set_port(port);
        }
    }
}

impl FromIterator<SocketAddr> for SocketAddrs {
    fn from_iter<T: IntoIterator<Item = SocketAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SocketAddrs {
    type Item = SocketAddr;
    type IntoIter = std::vec::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<SocketAddr>> for SocketAddrs {
    fn from(addrs: Vec<SocketAddr>) -> Self {
        Self(addrs)
    }
}

/// Resolves a host name and port into socket addresses.
pub trait Resolve: fmt::Debug + Send + Sync + 'static {
    /// Resolve `host`, returning addresses with `port` set.
    ///
    /// IPv6 literals are passed without brackets.
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<SocketAddrs>>;
}

impl<R> Resolve for Arc<R>
where
    R: Resolve + ?Sized,
{
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<SocketAddrs>> {
        (**self).resolve(host, port)
    }
}

/// GetAddrInfo based resolver.
///
/// This resolver uses the `getaddrinfo` system call to resolve
/// hostnames to IP addresses via the operating system.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<SocketAddrs>> {
        let span = tracing::Span::current();
        let host: Box<str> = host.into();
        JoinHandleFuture {
            handle: tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo", %host).in_scope(|| {
                    trace!("dns resolution starting");
                    (host.as_ref(), port)
                        .to_socket_addrs()
                        .map(SocketAddrs::from_iter)
                })
            }),
        }
        .boxed()
    }
}

/// Future which waits for a blocking resolution task, aborting it on drop.
#[pin_project(PinnedDrop)]
struct JoinHandleFuture<Addr> {
    #[pin]
    handle: JoinHandle<io::Result<Addr>>,
}

impl<Addr> fmt::Debug for JoinHandleFuture<Addr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandleFuture").finish()
    }
}

impl<Addr> Future for JoinHandleFuture<Addr> {
    type Output = io::Result<Addr>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(join_err) if join_err.is_cancelled() => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
            }
            Err(join_err) => Poll::Ready(Err(io::Error::other(join_err))),
        }
    }
}

#[pinned_drop]
impl<Addr> PinnedDrop for JoinHandleFuture<Addr> {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}

type CacheKey = (Box<str>, u16);

#[derive(Debug, Clone)]
struct CacheEntry {
    addrs: SocketAddrs,
    expires: Instant,
}

/// A resolver which caches the answers of another resolver.
///
/// Answers are kept for `ttl`. Static overrides always win over the
/// inner resolver and never expire.
#[derive(Debug, Clone)]
pub struct CachingResolver<R = GaiResolver> {
    inner: R,
    ttl: Duration,
    cache: Arc<Mutex<HashMap<CacheKey, CacheEntry>>>,
    overrides: Arc<HashMap<CacheKey, SocketAddrs>>,
}

impl CachingResolver<GaiResolver> {
    /// Cache answers from the system resolver.
    pub fn gai(ttl: Duration) -> Self {
        Self::new(GaiResolver::new(), ttl)
    }
}

impl<R> CachingResolver<R> {
    /// Cache answers from `inner` for `ttl`.
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Default::default(),
            overrides: Default::default(),
        }
    }

    /// Always answer `addrs` for `host` and `port`, without asking the inner resolver.
    pub fn with_override<A>(mut self, host: &str, port: u16, addrs: A) -> Self
    where
        A: Into<SocketAddrs>,
    {
        let mut addrs = addrs.into();
        addrs.set_port(port);
        Arc::make_mut(&mut self.overrides).insert((host.to_ascii_lowercase().into(), port), addrs);
        self
    }

    /// Forget every cached answer.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl<R> Resolve for CachingResolver<R>
where
    R: Resolve,
{
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<SocketAddrs>> {
        let key: CacheKey = (host.to_ascii_lowercase().into(), port);

        if let Some(addrs) = self.overrides.get(&key) {
            trace!(%host, port, "resolved from override");
            return std::future::ready(Ok(addrs.clone())).boxed();
        }

        {
            let mut cache = self.cache.lock();
            match cache.get(&key) {
                Some(entry) if entry.expires > Instant::now() => {
                    trace!(%host, port, "resolved from cache");
                    return std::future::ready(Ok(entry.addrs.clone())).boxed();
                }
                Some(_) => {
                    cache.remove(&key);
                }
                None => {}
            }
        }

        let lookup = self.inner.resolve(host, port);
        let cache = self.cache.clone();
        let ttl = self.ttl;
        async move {
            let addrs = lookup.await?;
            if !addrs.is_empty() {
                cache.lock().insert(
                    key,
                    CacheEntry {
                        addrs: addrs.clone(),
                        expires: Instant::now() + ttl,
                    },
                );
            }
            Ok(addrs)
        }
        .boxed()
    }
}

type HostsTable = HashMap<Box<str>, Vec<IpAddr>>;

#[derive(Debug, Default)]
struct HostsFile {
    entries: HostsTable,
    loaded: Option<Instant>,
}

/// A resolver which answers from a hosts file, asking another resolver for
/// names the file doesn't list.
///
/// The file is read on first use and again once `reload` has passed since
/// the last read. An unreadable file lists no names.
#[derive(Debug, Clone)]
pub struct HostsResolver<R = GaiResolver> {
    inner: R,
    path: Arc<Path>,
    reload: Duration,
    file: Arc<Mutex<HostsFile>>,
}

impl HostsResolver<GaiResolver> {
    /// Answer from `/etc/hosts`, then from the system resolver.
    pub fn system() -> Self {
        Self::new(GaiResolver::new())
    }
}

impl<R> HostsResolver<R> {
    /// Answer from `/etc/hosts`, then from `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            path: Arc::from(Path::new("/etc/hosts")),
            reload: Duration::from_secs(60),
            file: Default::default(),
        }
    }

    /// Read hosts from `path` instead.
    pub fn with_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Arc::from(path.into());
        self.file = Default::default();
        self
    }

    /// Re-read the file once `reload` has passed since it was last read.
    pub fn with_reload_interval(mut self, reload: Duration) -> Self {
        self.reload = reload;
        self
    }

    async fn refresh(&self) {
        let stale = self
            .file
            .lock()
            .loaded
            .map_or(true, |at| at.elapsed() >= self.reload);
        if !stale {
            return;
        }

        let entries = match tokio::fs::read_to_string(&*self.path).await {
            Ok(text) => parse_hosts(&text),
            Err(error) => {
                debug!(path = %self.path.display(), %error, "hosts file unreadable");
                HostsTable::new()
            }
        };

        let mut file = self.file.lock();
        file.entries = entries;
        file.loaded = Some(Instant::now());
    }

    fn lookup(&self, host: &str, port: u16) -> Option<SocketAddrs> {
        let file = self.file.lock();
        let ips = file.entries.get(host.to_ascii_lowercase().as_str())?;
        Some(ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
    }
}

impl<R> Resolve for HostsResolver<R>
where
    R: Resolve + Clone,
{
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<SocketAddrs>> {
        let resolver = self.clone();
        let host: Box<str> = host.into();
        async move {
            resolver.refresh().await;
            if let Some(addrs) = resolver.lookup(&host, port) {
                trace!(%host, port, "resolved from hosts file");
                return Ok(addrs);
            }
            resolver.inner.resolve(&host, port).await
        }
        .boxed()
    }
}

/// Parse hosts file text: an address followed by names, `#` starting a comment.
fn parse_hosts(text: &str) -> HostsTable {
    let mut entries = HostsTable::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let Some(ip) = fields.next().and_then(|field| field.parse::<IpAddr>().ok()) else {
            continue;
        };

        for name in fields {
            let ips = entries.entry(name.to_ascii_lowercase().into()).or_default();
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
    }
    entries
}
