//! View serving downstream connections.
//!
//! One `ServerView` exists per resource hub on a server. It tracks which
//! connections subscribed and at what permission, answers their known-set
//! and block requests out of the hub, fans new blocks out to readers and
//! accepts uploads from writers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use weft_core::{Block, Tick, TickSet};
use weft_perms::{Permission, PermissionPolicy};

use crate::command::Command;
use crate::connection::ConnectionHandle;
use crate::in_flight::{next_actor_id, BlockProvider, BlockRequester};
use crate::uri::{Origin, Uri};
use crate::view::View;

struct Subscriber {
    connection: Arc<ConnectionHandle>,
    permission: Permission,
}

#[derive(Default)]
struct ServerState {
    subscribers: HashMap<u64, Subscriber>,
    /// Connections waiting for the hub's known set.
    pending: Vec<Arc<ConnectionHandle>>,
    /// (connection, tick) -> requester id of an outstanding GET_BLOCK.
    fetches: HashMap<(u64, Tick), u64>,
    /// Ticks a writer announced that we asked it for.
    announced: HashMap<Tick, Arc<ConnectionHandle>>,
    /// Ticks every current subscriber has been told about.
    advertised: TickSet,
}

pub struct ServerView {
    id: u64,
    policy: Arc<dyn PermissionPolicy>,
    state: Mutex<ServerState>,
}

impl ServerView {
    pub fn new(policy: Arc<dyn PermissionPolicy>) -> Arc<Self> {
        Arc::new(Self {
            id: next_actor_id(),
            policy,
            state: Mutex::new(ServerState::default()),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn permission_of(&self, connection_id: u64) -> Option<Permission> {
        self.state
            .lock()
            .subscribers
            .get(&connection_id)
            .map(|s| s.permission)
    }

    /// Handle a command a downstream connection sent about this resource.
    pub fn handle(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>, command: Command) {
        match command {
            Command::Subscribe { .. } => self.subscribe(conn, uri),
            Command::Unsubscribe { .. } => self.disconnect(conn, uri),
            Command::GetKnown { .. } => self.request_known(conn, uri),
            Command::OnKnown { ticks, .. } => self.handle_known(conn, uri, &ticks),
            Command::GetBlock { tick, .. } => self.handle_get_block(conn, uri, tick),
            Command::CancelBlock { tick, .. } => self.handle_cancel(conn, uri, tick),
            Command::OnBlock { block, .. } => self.handle_block(conn, uri, block),
            Command::AckBlock { tick, .. } => {
                conn.acknowledged(uri.id(), tick);
            }
            other => {
                tracing::debug!(resource = uri.name(), opcode = ?other.opcode(), "ignoring command from downstream");
            }
        }
    }

    fn subscribe(&self, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>) {
        let permission = self.policy.decide(uri.name(), &conn.session());
        conn.post_permission(uri.name(), permission);
        if permission == Permission::Reject {
            tracing::info!(resource = uri.name(), connection = conn.id(), "subscription rejected");
            return;
        }
        tracing::debug!(resource = uri.name(), connection = conn.id(), %permission, "subscribed");
        {
            let mut state = self.state.lock();
            state.subscribers.insert(
                conn.id(),
                Subscriber {
                    connection: conn.clone(),
                    permission,
                },
            );
            state.pending.push(conn.clone());
        }
        uri.get_known();
    }

    fn request_known(&self, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>) {
        {
            let mut state = self.state.lock();
            if !state.subscribers.contains_key(&conn.id()) {
                return;
            }
            state.pending.push(conn.clone());
        }
        uri.get_known();
    }

    /// A subscriber announced what it holds. Answer with ours, and pull
    /// whatever we lack from writers.
    fn handle_known(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>, ticks: &TickSet) {
        let stored = uri.stored_known();
        let in_flight = uri.in_flight();
        let missing: Vec<Tick> = {
            let mut state = self.state.lock();
            let Some(sub) = state.subscribers.get(&conn.id()) else {
                return;
            };
            let can_write = sub.permission.can_write();
            state.pending.push(conn.clone());
            if !can_write {
                Vec::new()
            } else {
                let missing: Vec<Tick> = ticks
                    .iter()
                    .filter(|t| !stored.contains(*t) && !in_flight.is_pending(uri.id(), *t))
                    .collect();
                for tick in &missing {
                    state.announced.insert(*tick, conn.clone());
                }
                missing
            }
        };
        uri.get_known();

        let requester: Arc<dyn BlockRequester> = self.clone();
        for tick in missing {
            in_flight.get(uri.id(), tick, requester.clone(), || uri.fetch(tick));
        }
    }

    fn handle_get_block(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>, tick: Tick) {
        let requester = Arc::new(ServerRequester {
            id: next_actor_id(),
            view: Arc::downgrade(self),
            connection: conn.clone(),
            uri: uri.clone(),
        });
        {
            let mut state = self.state.lock();
            match state.subscribers.get(&conn.id()) {
                Some(sub) if sub.permission.can_read() => {}
                _ => return,
            }
            state.fetches.insert((conn.id(), tick), requester.id);
        }
        let in_flight = uri.in_flight();
        if in_flight.get(uri.id(), tick, requester, || uri.fetch(tick)) {
            in_flight.fail_if_unprovided(uri.id(), tick, "block not available");
        }
    }

    fn handle_cancel(&self, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>, tick: Tick) {
        let requester = self.state.lock().fetches.remove(&(conn.id(), tick));
        if let Some(requester) = requester {
            uri.in_flight().cancel(uri.id(), tick, requester);
        }
        conn.cancel_block(uri, tick);
    }

    fn handle_block(&self, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>, block: Block) {
        let tick = block.tick;
        let allowed = {
            let mut state = self.state.lock();
            let allowed = state
                .subscribers
                .get(&conn.id())
                .map(|s| s.permission.can_write())
                .unwrap_or(false);
            if allowed {
                state.announced.remove(&tick);
            }
            allowed
        };
        if !allowed {
            tracing::warn!(resource = uri.name(), %tick, connection = conn.id(), "dropping upload without write permission");
            return;
        }

        let in_flight = uri.in_flight();
        if let Err(e) = block.body() {
            tracing::warn!(resource = uri.name(), %tick, error = %e, "invalid block from downstream");
            in_flight.fail(uri.id(), tick, "invalid block");
            return;
        }
        in_flight.delivering(uri.id(), tick, conn.id());
        in_flight.expect_ack(uri.id(), tick, conn.clone());
        uri.publish_block(
            &block.with_requested(false),
            Origin::connection(self.id, conn.id()),
        );
    }

    /// Forget a connection: subscription, fetches and announcements.
    pub fn disconnect(&self, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>) {
        let cancelled: Vec<(Tick, u64)> = {
            let mut state = self.state.lock();
            state.subscribers.remove(&conn.id());
            state.pending.retain(|c| c.id() != conn.id());
            state.announced.retain(|_, c| c.id() != conn.id());
            let mine: Vec<(u64, Tick)> = state
                .fetches
                .keys()
                .filter(|(c, _)| *c == conn.id())
                .copied()
                .collect();
            mine.into_iter()
                .filter_map(|key| state.fetches.remove(&key).map(|r| (key.1, r)))
                .collect()
        };
        for (tick, requester) in cancelled {
            uri.in_flight().cancel(uri.id(), tick, requester);
        }
    }

    fn fetch_done(&self, conn_id: u64, tick: Tick) {
        self.state.lock().fetches.remove(&(conn_id, tick));
    }
}

impl View for ServerView {
    fn view_id(&self) -> u64 {
        self.id
    }

    fn get_known(&self, _uri: &Arc<Uri>) {}

    fn on_known(&self, uri: &Arc<Uri>, ticks: &TickSet, _source: u64) {
        let (pending, others, fresh) = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            let fresh: TickSet = ticks.iter().filter(|t| !state.advertised.contains(*t)).collect();
            state.advertised.union_with(ticks);
            let others: Vec<Arc<ConnectionHandle>> = if fresh.is_empty() {
                Vec::new()
            } else {
                state
                    .subscribers
                    .values()
                    .filter(|s| !pending.iter().any(|p| p.id() == s.connection.id()))
                    .map(|s| s.connection.clone())
                    .collect()
            };
            (pending, others, fresh)
        };
        for conn in pending {
            conn.post_known(uri.name(), ticks.clone());
        }
        for conn in others {
            conn.post_known(uri.name(), fresh.clone());
        }
    }

    fn get_block(&self, uri: &Arc<Uri>, tick: Tick) {
        let Some(conn) = self.state.lock().announced.get(&tick).cloned() else {
            return;
        };
        let provider = Arc::new(RemoteFetch {
            connection: conn.clone(),
            resource: uri.shared_name(),
        });
        if uri.in_flight().starting(uri.id(), tick, provider) {
            conn.post_get_block(uri.name(), tick);
        }
    }

    fn on_block(&self, uri: &Arc<Uri>, block: &Block, origin: Origin) {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let mut state = self.state.lock();
            state.advertised.insert(block.tick);
            state
                .subscribers
                .values()
                .filter(|s| s.permission.can_read())
                .filter(|s| !(origin.source == self.id && origin.connection == Some(s.connection.id())))
                .map(|s| s.connection.clone())
                .collect()
        };
        for conn in targets {
            conn.post_block(uri, block.clone().with_requested(false));
            conn.track_unacked(uri.id(), block.tick);
        }
    }

    fn on_ack(&self, uri: &Arc<Uri>, tick: Tick, _source: u64) {
        for conn in uri.in_flight().take_ack(uri.id(), tick) {
            conn.post_ack(uri.name(), tick);
        }
    }

    fn announces_known(&self) -> bool {
        false
    }
}

/// Pulls announced ticks: the view waits on these fetches but the block
/// itself arrives through the upload path.
impl BlockRequester for ServerView {
    fn requester_id(&self) -> u64 {
        self.id
    }

    fn on_block(&self, _block: &Block) {}

    fn failed(&self, tick: Tick, reason: &str) {
        self.state.lock().announced.remove(&tick);
        tracing::debug!(%tick, reason, "pull from writer failed");
    }
}

/// A downstream GET_BLOCK waiting in the in-flight table.
struct ServerRequester {
    id: u64,
    view: Weak<ServerView>,
    connection: Arc<ConnectionHandle>,
    uri: Arc<Uri>,
}

impl BlockRequester for ServerRequester {
    fn requester_id(&self) -> u64 {
        self.id
    }

    fn on_block(&self, block: &Block) {
        if let Some(view) = self.view.upgrade() {
            view.fetch_done(self.connection.id(), block.tick);
        }
        self.connection
            .post_block(&self.uri, block.clone().with_requested(true));
        self.connection.track_unacked(self.uri.id(), block.tick);
    }

    fn failed(&self, tick: Tick, reason: &str) {
        if let Some(view) = self.view.upgrade() {
            view.fetch_done(self.connection.id(), tick);
        }
        tracing::debug!(resource = self.uri.name(), %tick, reason, "downstream fetch failed");
    }
}

/// Asks a downstream writer for a block it announced.
struct RemoteFetch {
    connection: Arc<ConnectionHandle>,
    resource: Arc<str>,
}

impl BlockProvider for RemoteFetch {
    fn provider_id(&self) -> u64 {
        self.connection.id()
    }

    fn cancel(&self, tick: Tick) {
        self.connection.post_cancel(&self.resource, tick);
    }
}
