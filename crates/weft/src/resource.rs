//! Per-resource causal block graph.
//!
//! A [`Resource`] is one process's replica of a named resource. It listens
//! on the resource's [`Uri`] hub, fetches every tick it hears about that it
//! has not applied, holds arriving blocks until their causal past is
//! applied, and orders ready blocks into a [`BlockList`].
//!
//! ## Concurrency
//!
//! Hub callbacks and fetch completions never touch resource state directly.
//! They push an event onto a lock-free queue and try to drain it. Whoever
//! claims the drain flag applies every queued event; everyone else returns
//! at once, including callbacks fired by the drainer itself. Work that calls
//! back into the hub (fetches, republishing) is collected while the state
//! lock is held and performed after it is released.
//!
//! A fetch that fails marks its tick as failed. Failed ticks are not
//! requested again until a view announces them anew or a permission grant
//! arrives, so a block whose dependency nobody can provide stays pending
//! instead of refetching forever.
//!
//! ## States
//!
//! ```text
//! Unloaded -> Loading -> Pending <-> UpToDate
//!                  \________\___________\____> Cancelled(reason)
//! ```
//!
//! `UpToDate` means every announcing view has reported its known set and
//! nothing is pending or requested.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tokio::sync::watch;

use weft_core::{Block, BlockBody, Clock, MaxTickMap, ObjectId, Tick, TickSet, VersionSet};
use weft_perms::Permission;
use weft_sync::{next_actor_id, BlockRequester, Origin, Uri, UriListener};

use crate::convergence;
use crate::error::{Result, WeftError};
use crate::order::{BlockList, Insertion, OrderedBlock};
use crate::snapshot::Snapshot;

/// Why a resource stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    PermissionDenied,
    Unresolved,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Unloaded,
    Loading,
    Pending,
    UpToDate,
    Cancelled(CancelReason),
}

impl ResourceState {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResourceState::Cancelled(_))
    }
}

enum Incoming {
    Known { ticks: TickSet, source: u64 },
    Block(Block),
    Failed(Tick),
    Ack { tick: Tick, source: u64 },
    Permission(Permission),
    Unresolved,
}

struct PendingBlock {
    block: Block,
    body: BlockBody,
}

/// A local write whose bytes must be kept until every acknowledging view
/// confirmed it. Bit `i` of `waiting` stands for `Inner::ackers[i]`.
struct PendingAck {
    block: Block,
    waiting: u64,
}

#[derive(Default)]
struct Effects {
    fetch: Vec<Tick>,
    cancel: Vec<Tick>,
    publish: Vec<Block>,
}

#[derive(Default)]
struct Inner {
    blocks: BlockList,
    loaded: MaxTickMap,
    applied: TickSet,
    max_generation: u64,
    pending: HashMap<Tick, PendingBlock>,
    requested: TickSet,
    /// Fetches that failed; not retried until announced again.
    failed: TickSet,
    announcing: Vec<u64>,
    reported: Vec<u64>,
    ackers: Vec<u64>,
    pending_acks: HashMap<Tick, PendingAck>,
    permission: Option<Permission>,
    opened: bool,
    cancelled: Option<CancelReason>,
}

impl Inner {
    fn is_known(&self, tick: Tick) -> bool {
        self.applied.contains(tick) || self.pending.contains_key(&tick) || self.loaded.dominates(tick)
    }

    fn ack_bits(&mut self, ackers: &[u64]) -> u64 {
        let mut bits = 0u64;
        for acker in ackers {
            let index = match self.ackers.iter().position(|a| a == acker) {
                Some(index) => index,
                None => {
                    self.ackers.push(*acker);
                    self.ackers.len() - 1
                }
            };
            if index < u64::BITS as usize {
                bits |= 1 << index;
            } else {
                tracing::warn!(acker, "too many acknowledging views, not tracking");
            }
        }
        bits
    }

    fn apply(&mut self, tick: Tick, body: BlockBody) -> Result<Insertion> {
        let entry = OrderedBlock::new(tick, body)?;
        self.max_generation = self.max_generation.max(entry.generation);
        let insertion = self.blocks.insert(entry);
        self.loaded.put_max(tick);
        self.applied.insert(tick);
        Ok(insertion)
    }
}

pub struct Resource {
    id: u64,
    me: Weak<Resource>,
    name: Arc<str>,
    uri: Arc<Uri>,
    clock: Arc<Clock>,
    snapshot: Arc<dyn Snapshot>,
    incoming: SegQueue<Incoming>,
    draining: AtomicBool,
    inner: Mutex<Inner>,
    state: watch::Sender<ResourceState>,
}

impl Resource {
    /// Attach a new replica to `uri` and start loading it.
    pub fn open(uri: Arc<Uri>, clock: Arc<Clock>, snapshot: Arc<dyn Snapshot>) -> Arc<Self> {
        let (state, _) = watch::channel(ResourceState::Unloaded);
        let resource = Arc::new_cyclic(|me| Resource {
            id: next_actor_id(),
            me: me.clone(),
            name: uri.shared_name(),
            uri: uri.clone(),
            clock,
            snapshot,
            incoming: SegQueue::new(),
            draining: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
            state,
        });
        uri.add_listener(resource.clone());
        resource.load();
        resource
    }

    fn load(&self) {
        let announcing = self.uri.announcing_views();
        {
            let mut inner = self.inner.lock();
            inner.announcing = announcing;
            inner.opened = true;
        }
        self.set_state(ResourceState::Loading);
        tracing::debug!(resource = %self.name, "loading");
        self.uri.get_known();
        self.drain();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &Arc<Uri> {
        &self.uri
    }

    pub fn state(&self) -> ResourceState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState> {
        self.state.subscribe()
    }

    /// Permission last granted by an upstream, if any.
    pub fn permission(&self) -> Option<Permission> {
        self.inner.lock().permission
    }

    /// Wait until the replica caught up with every announcing view.
    pub async fn wait_up_to_date(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, ResourceState::UpToDate | ResourceState::Cancelled(_)))
            .await
            .map_err(|_| WeftError::Closed(self.name.to_string()))?
            .clone();
        match state {
            ResourceState::Cancelled(reason) => Err(self.cancel_error(reason)),
            _ => Ok(()),
        }
    }

    fn cancel_error(&self, reason: CancelReason) -> WeftError {
        let name = self.name.to_string();
        match reason {
            CancelReason::PermissionDenied => WeftError::PermissionDenied(name),
            CancelReason::Unresolved => WeftError::Remote(name),
            CancelReason::Closed => WeftError::Closed(name),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Write `versions` as a new block.
    ///
    /// The block depends on every ordered block writing one of the same
    /// objects and carries the current loaded vector. It is applied locally
    /// before it is published, with the blocks it fully supersedes listed
    /// as removals.
    pub fn write(&self, versions: VersionSet) -> Result<Tick> {
        let ackers = self.uri.acknowledging_views();
        let block = {
            let mut inner = self.inner.lock();
            if let Some(reason) = inner.cancelled {
                return Err(self.cancel_error(reason));
            }
            let tick = self.clock.next()?;
            let body = BlockBody {
                deps: inner.blocks.overlapping(&versions),
                happened_before: inner.loaded.clone(),
                generation: inner.max_generation + 1,
                versions,
            };
            let block = Block::from_body(tick, &body)?;
            let insertion = inner.apply(tick, body)?;
            self.snapshot.merge(&self.name, tick, &insertion.effective);

            let block = block.with_removals(insertion.removed.into_iter().collect());
            let waiting = inner.ack_bits(&ackers);
            if waiting != 0 {
                inner.pending_acks.insert(
                    tick,
                    PendingAck {
                        block: block.clone(),
                        waiting,
                    },
                );
            }
            block
        };

        tracing::debug!(resource = %self.name, tick = %block.tick, "local write");
        self.uri.publish_block(&block, Origin::local(self.id));
        self.drain();
        Ok(block.tick)
    }

    /// Hand a block to the replica directly, as if a view delivered it.
    pub fn receive(&self, block: Block) {
        self.push(Incoming::Block(block));
    }

    /// Detach from the hub and stop all outstanding fetches.
    pub fn close(&self) {
        let requested = {
            let mut inner = self.inner.lock();
            if inner.cancelled.is_some() {
                return;
            }
            inner.cancelled = Some(CancelReason::Closed);
            let requested: Vec<Tick> = inner.requested.iter().collect();
            inner.requested.clear();
            requested
        };
        for tick in requested {
            self.uri.in_flight().cancel(self.uri.id(), tick, self.id);
        }
        self.uri.remove_listener(self.id);
        self.set_state(ResourceState::Cancelled(CancelReason::Closed));
        tracing::debug!(resource = %self.name, "closed");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Ticks of the ordered blocks, oldest first.
    pub fn ordered_ticks(&self) -> Vec<Tick> {
        self.inner.lock().blocks.ticks()
    }

    pub fn blocks(&self) -> Vec<OrderedBlock> {
        self.inner.lock().blocks.iter().cloned().collect()
    }

    pub fn value(&self, object: ObjectId) -> Option<Bytes> {
        self.inner.lock().blocks.value(object).cloned()
    }

    pub fn values(&self) -> BTreeMap<ObjectId, Bytes> {
        self.inner.lock().blocks.values()
    }

    pub fn applied(&self) -> TickSet {
        self.inner.lock().applied.clone()
    }

    pub fn loaded(&self) -> MaxTickMap {
        self.inner.lock().loaded.clone()
    }

    /// Blocks received but still waiting for their causal past.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn requested_count(&self) -> usize {
        self.inner.lock().requested.len()
    }

    /// Ticks whose fetch failed and that are waiting to be announced again.
    pub fn failed(&self) -> TickSet {
        self.inner.lock().failed.clone()
    }

    /// Local writes not yet acknowledged by every acknowledging view.
    pub fn unacknowledged(&self) -> Vec<Tick> {
        let mut ticks: Vec<Tick> = self.inner.lock().pending_acks.keys().copied().collect();
        ticks.sort_unstable();
        ticks
    }

    /// Digest of the ordered list, comparable across processes.
    pub fn state_hash(&self) -> blake3::Hash {
        convergence::state_hash(self.inner.lock().blocks.iter())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event processing
    // ─────────────────────────────────────────────────────────────────────────

    fn push(&self, event: Incoming) {
        self.incoming.push(event);
        self.drain();
    }

    fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let effects = {
                    let mut inner = self.inner.lock();
                    let mut effects = Effects::default();
                    while let Some(event) = self.incoming.pop() {
                        self.handle(&mut inner, event, &mut effects);
                    }
                    self.settle(&mut inner, &mut effects);
                    effects
                };
                self.perform(effects);
                if self.incoming.is_empty() {
                    break;
                }
            }
            self.draining.store(false, Ordering::Release);
            // An event pushed after the last check but before the flag was
            // released would otherwise wait for the next push.
            if self.incoming.is_empty() {
                return;
            }
        }
    }

    fn handle(&self, inner: &mut Inner, event: Incoming, effects: &mut Effects) {
        if inner.cancelled.is_some() {
            return;
        }
        match event {
            Incoming::Known { ticks, source } => {
                if inner.announcing.contains(&source) && !inner.reported.contains(&source) {
                    inner.reported.push(source);
                }
                for tick in ticks.iter() {
                    inner.failed.remove(tick);
                }
                self.request_missing(inner, ticks.iter(), effects);
            }
            Incoming::Block(block) => self.accept(inner, block),
            Incoming::Failed(tick) => {
                if inner.requested.remove(tick) {
                    inner.failed.insert(tick);
                    tracing::debug!(resource = %self.name, %tick, "fetch failed, falling back to loaded state");
                }
            }
            Incoming::Ack { tick, source } => {
                let Some(index) = inner.ackers.iter().position(|a| *a == source) else {
                    return;
                };
                if let Entry::Occupied(mut entry) = inner.pending_acks.entry(tick) {
                    entry.get_mut().waiting &= !(1u64 << index);
                    if entry.get().waiting == 0 {
                        entry.remove();
                        tracing::trace!(resource = %self.name, %tick, "write acknowledged");
                    }
                }
            }
            Incoming::Permission(permission) => {
                let was_writable = inner.permission.map_or(false, Permission::can_write);
                inner.permission = Some(permission);
                // A fresh grant usually means a fresh connection to ask.
                inner.failed.clear();
                if permission == Permission::Reject {
                    tracing::warn!(resource = %self.name, "permission rejected");
                    self.cancel(inner, CancelReason::PermissionDenied, effects);
                } else if permission.can_write() && !was_writable {
                    let mut offline: Vec<&PendingAck> = inner.pending_acks.values().collect();
                    offline.sort_unstable_by_key(|p| p.block.tick);
                    if !offline.is_empty() {
                        tracing::debug!(resource = %self.name, count = offline.len(), "flushing offline writes");
                    }
                    effects.publish.extend(offline.into_iter().map(|p| p.block.clone()));
                }
            }
            Incoming::Unresolved => {
                tracing::warn!(resource = %self.name, "resource unresolved upstream");
                self.cancel(inner, CancelReason::Unresolved, effects);
            }
        }
    }

    fn cancel(&self, inner: &mut Inner, reason: CancelReason, effects: &mut Effects) {
        inner.cancelled = Some(reason);
        effects.cancel.extend(inner.requested.iter());
        inner.requested.clear();
        inner.pending.clear();
    }

    fn accept(&self, inner: &mut Inner, block: Block) {
        let tick = block.tick;
        inner.requested.remove(tick);
        inner.failed.remove(tick);
        if !tick.is_valid() || inner.is_known(tick) {
            return;
        }
        match block.body() {
            Ok(body) => {
                self.clock.observe(tick);
                inner.pending.insert(tick, PendingBlock { block, body });
            }
            Err(e) => {
                tracing::warn!(resource = %self.name, %tick, error = %e, "discarding malformed block");
            }
        }
    }

    fn request_missing(
        &self,
        inner: &mut Inner,
        ticks: impl IntoIterator<Item = Tick>,
        effects: &mut Effects,
    ) {
        for tick in ticks {
            if tick.is_valid()
                && !inner.is_known(tick)
                && !inner.failed.contains(tick)
                && inner.requested.insert(tick)
            {
                effects.fetch.push(tick);
            }
        }
    }

    /// Apply every pending block whose causal past is satisfied, then
    /// recompute the state.
    fn settle(&self, inner: &mut Inner, effects: &mut Effects) {
        if let Some(reason) = inner.cancelled {
            self.set_state(ResourceState::Cancelled(reason));
            return;
        }

        for pending in take_ready(inner) {
            let tick = pending.block.tick;
            match inner.apply(tick, pending.body) {
                Ok(insertion) => {
                    self.snapshot.merge(&self.name, tick, &insertion.effective);
                    tracing::trace!(resource = %self.name, %tick, "block applied");
                }
                Err(e) => tracing::warn!(resource = %self.name, %tick, error = %e, "cannot apply block"),
            }
        }

        let wanted: Vec<Tick> = inner
            .pending
            .values()
            .flat_map(|p| p.body.deps.iter().chain(p.body.happened_before.iter()))
            .collect();
        self.request_missing(inner, wanted, effects);

        let state = if !inner.opened {
            ResourceState::Unloaded
        } else if !inner.pending.is_empty() || !inner.requested.is_empty() {
            ResourceState::Pending
        } else if inner.announcing.iter().all(|v| inner.reported.contains(v)) {
            ResourceState::UpToDate
        } else {
            ResourceState::Loading
        };
        self.set_state(state);
    }

    fn perform(&self, effects: Effects) {
        let in_flight = self.uri.in_flight();
        for tick in effects.cancel {
            in_flight.cancel(self.uri.id(), tick, self.id);
        }
        if !effects.fetch.is_empty() {
            if let Some(me) = self.me.upgrade() {
                for tick in effects.fetch {
                    let requester: Arc<dyn BlockRequester> = me.clone();
                    let first = in_flight.get(self.uri.id(), tick, requester, || self.uri.fetch(tick));
                    if first {
                        in_flight.fail_if_unprovided(self.uri.id(), tick, "no provider");
                    }
                }
            }
        }
        for block in effects.publish {
            self.uri.publish_block(&block, Origin::local(self.id));
        }
    }

    fn set_state(&self, state: ResourceState) {
        self.state.send_if_modified(|current| {
            if current.is_cancelled() || *current == state {
                return false;
            }
            tracing::trace!(resource = %self.name, from = ?current, to = ?state, "state changed");
            *current = state;
            true
        });
    }
}

/// Remove and return every pending block whose dependencies and
/// happened-before entries are covered by the loaded vector or by blocks
/// picked earlier in the same pass.
fn take_ready(inner: &mut Inner) -> Vec<PendingBlock> {
    let mut picked = inner.loaded.clone();
    let mut picked_ticks = TickSet::new();
    loop {
        let round: Vec<Tick> = inner
            .pending
            .iter()
            .filter(|(tick, _)| !picked_ticks.contains(**tick))
            .filter(|(_, p)| {
                p.body.deps.iter().all(|d| {
                    inner.applied.contains(d) || picked_ticks.contains(d) || picked.dominates(d)
                }) && p.body.happened_before.iter().all(|h| picked.dominates(h))
            })
            .map(|(tick, _)| *tick)
            .collect();
        if round.is_empty() {
            break;
        }
        for tick in round {
            picked.put_max(tick);
            picked_ticks.insert(tick);
        }
    }

    picked_ticks
        .to_sorted_vec()
        .into_iter()
        .filter_map(|tick| inner.pending.remove(&tick))
        .collect()
}

impl UriListener for Resource {
    fn listener_id(&self) -> u64 {
        self.id
    }

    fn on_known(&self, _uri: &Arc<Uri>, ticks: &TickSet, source: u64) {
        self.push(Incoming::Known {
            ticks: ticks.clone(),
            source,
        });
    }

    fn on_block(&self, _uri: &Arc<Uri>, block: &Block, _origin: Origin) {
        self.push(Incoming::Block(block.clone()));
    }

    fn on_ack(&self, _uri: &Arc<Uri>, tick: Tick, source: u64) {
        self.push(Incoming::Ack { tick, source });
    }

    fn on_permission(&self, _uri: &Arc<Uri>, permission: Permission, _source: u64) {
        self.push(Incoming::Permission(permission));
    }

    fn on_unresolved(&self, _uri: &Arc<Uri>, _source: u64) {
        self.push(Incoming::Unresolved);
    }

    fn known(&self) -> TickSet {
        self.inner.lock().applied.clone()
    }

    fn local_block(&self, tick: Tick) -> Option<Block> {
        self.inner
            .lock()
            .pending_acks
            .get(&tick)
            .map(|p| p.block.clone())
    }
}

impl BlockRequester for Resource {
    fn requester_id(&self) -> u64 {
        self.id
    }

    fn on_block(&self, block: &Block) {
        self.push(Incoming::Block(block.clone()));
    }

    fn failed(&self, tick: Tick, _reason: &str) {
        self.push(Incoming::Failed(tick));
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
