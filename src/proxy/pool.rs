//! Pooled backend connections
//!
//! Every backend address gets a small set of long-lived HTTP/2 channels, each
//! multiplexing many concurrent proxied streams. Per address the pool keeps an
//! intrusive doubly-linked *active* list of selectable connections and a *busy*
//! list of connections at their stream cap; links are slab indices, so moving a
//! connection between lists is O(1) and no node ever leaves the pool.
//!
//! `get` walks the active list under the pool lock, retiring connections that
//! have failed, been shut down, or outlived their TTL, and dials a fresh
//! channel outside the lock when nothing qualifies. Dials past the per-address
//! capacity still succeed: the caller gets a detached overflow connection that
//! is closed (or adopted, if room opened up) on release.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tonic::transport::Channel;

use crate::config::PoolOptions;
use crate::error::RelayResult;

/// Establishes a channel to a backend address.
///
/// Injected into the pool rather than being a process-wide default, so tests
/// and embedders can swap the transport without touching pool logic.
#[tonic::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> RelayResult<Channel>;
}

/// Observed connection health.
///
/// tonic channels do not surface transport connectivity, so state is derived
/// from what the pool sees: a successful dial starts `Ready`, a call released
/// with an error marks `TransientFailure`, teardown marks `Shutdown`. Non-ready
/// connections are skipped by `get` and removed once their last stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Ready,
    TransientFailure,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListTag {
    Active,
    Busy,
    Detached,
}

struct ConnSlot {
    channel: Channel,
    addr: String,
    created: Instant,
    streams: u32,
    state: ConnState,
    prev: Option<usize>,
    next: Option<usize>,
    list: ListTag,
}

/// Slab of connection slots; list links are indices into it.
#[derive(Default)]
struct Arena {
    slots: Vec<Option<ConnSlot>>,
    free: Vec<usize>,
}

impl Arena {
    fn insert(&mut self, slot: ConnSlot) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    fn remove(&mut self, idx: usize) -> ConnSlot {
        let slot = self.slots[idx].take().expect("pool slot already removed");
        self.free.push(idx);
        slot
    }

    fn get(&self, idx: usize) -> &ConnSlot {
        self.slots[idx].as_ref().expect("pool slot missing")
    }

    fn get_mut(&mut self, idx: usize) -> &mut ConnSlot {
        self.slots[idx].as_mut().expect("pool slot missing")
    }
}

#[derive(Default)]
struct AddrEntry {
    active: Option<usize>,
    busy: Option<usize>,
    /// Connections on either list. Detached overflow connections do not count.
    count: usize,
    /// Listed connections with zero in-flight streams.
    idle: usize,
}

#[derive(Default)]
struct PoolInner {
    arena: Arena,
    addrs: HashMap<String, AddrEntry>,
}

impl PoolInner {
    fn push_front(&mut self, addr: &str, idx: usize, tag: ListTag) {
        let old_head = {
            let entry = self.addrs.get_mut(addr).expect("pool address entry");
            let head = match tag {
                ListTag::Active => &mut entry.active,
                ListTag::Busy => &mut entry.busy,
                ListTag::Detached => unreachable!("cannot link a detached slot"),
            };
            let old = *head;
            *head = Some(idx);
            entry.count += 1;
            old
        };
        {
            let slot = self.arena.get_mut(idx);
            slot.prev = None;
            slot.next = old_head;
            slot.list = tag;
        }
        if let Some(old) = old_head {
            self.arena.get_mut(old).prev = Some(idx);
        }
    }

    fn unlink(&mut self, addr: &str, idx: usize) {
        let (prev, next, tag) = {
            let slot = self.arena.get(idx);
            (slot.prev, slot.next, slot.list)
        };
        if tag == ListTag::Detached {
            return;
        }
        match prev {
            Some(prev) => self.arena.get_mut(prev).next = next,
            None => {
                let entry = self.addrs.get_mut(addr).expect("pool address entry");
                match tag {
                    ListTag::Active => entry.active = next,
                    ListTag::Busy => entry.busy = next,
                    ListTag::Detached => {}
                }
            }
        }
        if let Some(next) = next {
            self.arena.get_mut(next).prev = prev;
        }
        {
            let slot = self.arena.get_mut(idx);
            slot.prev = None;
            slot.next = None;
            slot.list = ListTag::Detached;
        }
        self.addrs.get_mut(addr).expect("pool address entry").count -= 1;
    }

    /// Unlink an idle connection and drop its slot; dropping the channel
    /// closes it once no lease still clones it.
    fn retire_idle(&mut self, addr: &str, idx: usize) {
        self.unlink(addr, idx);
        self.addrs.get_mut(addr).expect("pool address entry").idle -= 1;
        self.arena.remove(idx);
    }

    fn list_totals(&self, mut head: Option<usize>) -> (usize, usize) {
        let (mut conns, mut streams) = (0, 0);
        while let Some(idx) = head {
            let slot = self.arena.get(idx);
            conns += 1;
            streams += slot.streams as usize;
            head = slot.next;
        }
        (conns, streams)
    }
}

/// Pool-wide snapshot, for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub addresses: usize,
    pub connections: usize,
    pub idle: usize,
    pub busy: usize,
    pub total_streams: usize,
}

/// Per-address snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrStats {
    pub connections: usize,
    pub idle: usize,
    pub busy: usize,
    pub streams: usize,
}

/// Keyed pool of multiplexed backend channels.
pub struct ConnPool {
    opts: PoolOptions,
    inner: Mutex<PoolInner>,
    /// Handed to leases so they can find their way back.
    self_ref: Weak<ConnPool>,
}

impl ConnPool {
    pub fn new(mut opts: PoolOptions) -> Arc<Self> {
        if opts.size == 0 {
            opts.size = 1;
        }
        if opts.max_streams == 0 {
            opts.max_streams = 1;
        }
        Arc::new_cyclic(|self_ref| Self {
            opts,
            inner: Mutex::new(PoolInner::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    /// Check out a connection to `addr` with capacity for one more stream,
    /// dialing a fresh one if nothing in the pool qualifies.
    ///
    /// The returned lease accounts for the caller: its stream is already
    /// counted, and it must be released exactly once.
    pub async fn get(&self, addr: &str, dialer: &dyn Dialer) -> RelayResult<PooledConn> {
        if let Some(conn) = self.checkout_existing(addr) {
            return Ok(conn);
        }

        // Dial without holding the pool lock.
        let channel = dialer.dial(addr).await?;

        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.addrs.entry(addr.to_owned()).or_default();
        let idx = inner.arena.insert(ConnSlot {
            channel: channel.clone(),
            addr: addr.to_owned(),
            created: Instant::now(),
            streams: 1,
            state: ConnState::Ready,
            prev: None,
            next: None,
            list: ListTag::Detached,
        });
        if inner.addrs[addr].count < self.opts.size {
            inner.push_front(addr, idx, ListTag::Active);
        } else {
            // Over capacity: the caller still gets the connection, but it
            // stays off the lists and is closed (or adopted) on release.
            tracing::debug!(%addr, "pool at capacity, handing out overflow connection");
        }
        drop(inner);

        tracing::debug!(%addr, "dialed new backend connection");
        Ok(PooledConn {
            channel,
            addr: addr.to_owned(),
            lease: Some((idx, self.self_ref.clone())),
            released: false,
        })
    }

    fn checkout_existing(&self, addr: &str) -> Option<PooledConn> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let mut cur = inner.addrs.get(addr)?.active;
        while let Some(idx) = cur {
            let (next, state, streams, expired) = {
                let slot = inner.arena.get(idx);
                (
                    slot.next,
                    slot.state,
                    slot.streams,
                    slot.created.elapsed() > self.opts.ttl(),
                )
            };
            match state {
                ConnState::Shutdown | ConnState::TransientFailure => {
                    if streams == 0 {
                        inner.retire_idle(addr, idx);
                    }
                }
                ConnState::Ready if expired => {
                    if streams == 0 {
                        inner.retire_idle(addr, idx);
                    }
                }
                ConnState::Ready if streams >= self.opts.max_streams => {
                    inner.unlink(addr, idx);
                    inner.push_front(addr, idx, ListTag::Busy);
                }
                ConnState::Ready => {
                    if streams == 0 {
                        inner.addrs.get_mut(addr).expect("pool address entry").idle -= 1;
                    }
                    let slot = inner.arena.get_mut(idx);
                    slot.streams += 1;
                    let channel = slot.channel.clone();
                    return Some(PooledConn {
                        channel,
                        addr: addr.to_owned(),
                        lease: Some((idx, self.self_ref.clone())),
                        released: false,
                    });
                }
            }
            cur = next;
        }
        None
    }

    fn release(&self, idx: usize, errored: bool) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let addr = inner.arena.get(idx).addr.clone();

        if errored {
            inner.arena.get_mut(idx).state = ConnState::TransientFailure;
        }

        // Adopt an overflow connection if capacity has freed up meanwhile.
        if inner.arena.get(idx).list == ListTag::Detached
            && inner.addrs[addr.as_str()].count < self.opts.size
        {
            inner.push_front(&addr, idx, ListTag::Active);
        }
        if inner.arena.get(idx).list == ListTag::Detached {
            inner.arena.remove(idx);
            tracing::debug!(%addr, "closed overflow backend connection");
            return;
        }

        // A busy connection about to drop below the cap becomes selectable.
        let streams = inner.arena.get(idx).streams;
        if inner.arena.get(idx).list == ListTag::Busy && streams >= self.opts.max_streams {
            inner.unlink(&addr, idx);
            inner.push_front(&addr, idx, ListTag::Active);
        }

        let slot = inner.arena.get_mut(idx);
        slot.streams -= 1;
        let (streams, state, expired) = (
            slot.streams,
            slot.state,
            slot.created.elapsed() > self.opts.ttl(),
        );
        if streams == 0 {
            let idle = inner.addrs[addr.as_str()].idle;
            if errored || state != ConnState::Ready || idle >= self.opts.max_idle || expired {
                inner.unlink(&addr, idx);
                inner.arena.remove(idx);
                tracing::debug!(%addr, errored, "closed backend connection");
            } else {
                inner.addrs.get_mut(&addr).expect("pool address entry").idle += 1;
            }
        }
    }

    /// Tear the pool down: idle connections close now, in-flight ones close as
    /// their last stream is released.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let indices: Vec<usize> = inner
            .arena
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx))
            .collect();
        for idx in indices {
            let (streams, listed, addr) = {
                let slot = inner.arena.get(idx);
                (slot.streams, slot.list != ListTag::Detached, slot.addr.clone())
            };
            if streams == 0 && listed {
                inner.retire_idle(&addr, idx);
            } else {
                inner.arena.get_mut(idx).state = ConnState::Shutdown;
            }
        }
        tracing::debug!("backend pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("pool lock poisoned");
        let mut stats = PoolStats {
            addresses: inner.addrs.len(),
            ..PoolStats::default()
        };
        for entry in inner.addrs.values() {
            let (active_conns, active_streams) = inner.list_totals(entry.active);
            let (busy_conns, busy_streams) = inner.list_totals(entry.busy);
            stats.connections += active_conns + busy_conns;
            stats.busy += busy_conns;
            stats.idle += entry.idle;
            stats.total_streams += active_streams + busy_streams;
        }
        stats
    }

    pub fn address_stats(&self, addr: &str) -> Option<AddrStats> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        let entry = inner.addrs.get(addr)?;
        let (active_conns, active_streams) = inner.list_totals(entry.active);
        let (busy_conns, busy_streams) = inner.list_totals(entry.busy);
        Some(AddrStats {
            connections: active_conns + busy_conns,
            idle: entry.idle,
            busy: busy_conns,
            streams: active_streams + busy_streams,
        })
    }
}

/// A checked-out backend connection.
///
/// Cloning the inner channel is cheap; the lease itself must be released
/// exactly once with the call's outcome. Dropping an unreleased lease counts
/// as an errored release so an abandoned call can never leak pool accounting.
pub struct PooledConn {
    channel: Channel,
    addr: String,
    lease: Option<(usize, Weak<ConnPool>)>,
    released: bool,
}

impl PooledConn {
    /// A connection that does not belong to any pool; release is a no-op.
    pub fn detached(channel: Channel) -> Self {
        Self {
            channel,
            addr: String::new(),
            lease: None,
            released: false,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Return the connection to its pool, reporting whether the call failed.
    pub fn release(mut self, errored: bool) {
        self.finish(errored);
    }

    fn finish(&mut self, errored: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some((idx, pool)) = self.lease.take()
            && let Some(pool) = pool.upgrade()
        {
            pool.release(idx, errored);
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.finish(true);
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("addr", &self.addr)
            .field("pooled", &self.lease.is_some())
            .finish()
    }
}
