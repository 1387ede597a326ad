//! View forwarding a resource to and from an upstream location.
//!
//! The view subscribes when a connection is attached and learns its
//! permission from the upstream's PERMISSION reply. Blocks always flow
//! down. Local blocks flow up only under `Write`; until then they stay
//! with whoever produced them, which republishes once `Write` arrives.

use std::sync::Arc;

use parking_lot::Mutex;

use weft_core::{Block, Tick, TickSet};
use weft_perms::Permission;

use crate::command::Command;
use crate::connection::ConnectionHandle;
use crate::in_flight::{next_actor_id, BlockProvider};
use crate::uri::{Origin, Uri};
use crate::view::View;

#[derive(Default)]
struct ClientState {
    connection: Option<Arc<ConnectionHandle>>,
    permission: Option<Permission>,
    /// What the upstream holds, as far as we know.
    upstream_known: Option<TickSet>,
}

impl ClientState {
    fn writable(&self) -> Option<Arc<ConnectionHandle>> {
        match self.permission {
            Some(Permission::Write) => self.connection.clone(),
            _ => None,
        }
    }
}

pub struct ClientView {
    id: u64,
    name: Arc<str>,
    state: Mutex<ClientState>,
}

impl ClientView {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: next_actor_id(),
            name: Arc::from(name),
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn permission(&self) -> Option<Permission> {
        self.state.lock().permission
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    /// Start using `conn` and subscribe over it.
    pub fn attach(&self, conn: Arc<ConnectionHandle>) {
        conn.post_subscribe(&self.name);
        let mut state = self.state.lock();
        state.connection = Some(conn);
        state.permission = None;
        state.upstream_known = None;
    }

    /// The connection went away. Fetches only we were serving fail.
    pub fn detach(&self, uri: &Arc<Uri>) {
        {
            let mut state = self.state.lock();
            state.connection = None;
            state.permission = None;
            state.upstream_known = None;
        }
        uri.in_flight().provider_lost(self.id);
    }

    /// Handle a command the upstream sent about this resource.
    pub fn handle(&self, uri: &Arc<Uri>, command: Command) {
        match command {
            Command::Permission { permission, .. } => self.handle_permission(uri, permission),
            Command::OnKnown { ticks, .. } => {
                {
                    let mut state = self.state.lock();
                    let known = state.upstream_known.get_or_insert_with(TickSet::new);
                    known.union_with(&ticks);
                }
                uri.publish_known(&ticks, self.id);
            }
            Command::OnBlock { block, .. } => self.handle_block(uri, block),
            Command::AckBlock { tick, .. } => {
                if let Some(known) = self.state.lock().upstream_known.as_mut() {
                    known.insert(tick);
                }
                uri.publish_ack(tick, self.id);
            }
            Command::GetBlock { tick, .. } => self.handle_get_block(uri, tick),
            Command::CancelBlock { tick, .. } => {
                if let Some(conn) = self.state.lock().connection.clone() {
                    conn.cancel_block(uri, tick);
                }
            }
            Command::GetKnown { .. } => {
                if let Some(conn) = self.state.lock().writable() {
                    conn.post_known(uri.name(), local_ticks(uri));
                }
            }
            Command::Unresolved { .. } => {
                tracing::warn!(resource = uri.name(), "upstream cannot resolve resource");
                uri.publish_unresolved(self.id);
            }
            other => {
                tracing::debug!(resource = uri.name(), opcode = ?other.opcode(), "ignoring command from upstream");
            }
        }
    }

    fn handle_permission(&self, uri: &Arc<Uri>, permission: Permission) {
        let announce = {
            let mut state = self.state.lock();
            state.permission = Some(permission);
            state.writable()
        };
        tracing::debug!(resource = uri.name(), %permission, "upstream granted permission");
        if let Some(conn) = announce {
            conn.post_known(uri.name(), local_ticks(uri));
        }
        uri.publish_permission(permission, self.id);
    }

    fn handle_block(&self, uri: &Arc<Uri>, block: Block) {
        let tick = block.tick;
        let in_flight = uri.in_flight();
        if let Err(e) = block.body() {
            tracing::warn!(resource = uri.name(), %tick, error = %e, "invalid block from upstream");
            in_flight.fail(uri.id(), tick, "invalid block");
            return;
        }
        let conn = {
            let mut state = self.state.lock();
            if let Some(known) = state.upstream_known.as_mut() {
                known.insert(tick);
            }
            state.connection.clone()
        };
        in_flight.delivering(uri.id(), tick, self.id);
        uri.publish_block(&block.with_requested(false), Origin::local(self.id));
        if let Some(conn) = conn {
            conn.post_ack(uri.name(), tick);
        }
    }

    fn handle_get_block(&self, uri: &Arc<Uri>, tick: Tick) {
        let Some(conn) = self.state.lock().writable() else {
            return;
        };
        match uri.local_block(tick) {
            Some(block) => conn.post_block(uri, block.with_requested(true)),
            None => tracing::debug!(resource = uri.name(), %tick, "upstream asked for a block we do not hold"),
        }
    }
}

fn local_ticks(uri: &Uri) -> TickSet {
    let mut ticks = uri.local_known();
    ticks.union_with(&uri.stored_known());
    ticks
}

impl View for ClientView {
    fn view_id(&self) -> u64 {
        self.id
    }

    /// Republish the cached upstream known set, or ask for it again if the
    /// upstream granted access but has not announced yet.
    fn get_known(&self, uri: &Arc<Uri>) {
        let (known, granted) = {
            let state = self.state.lock();
            let granted = state
                .permission
                .filter(|p| p.can_read())
                .and(state.connection.clone());
            (state.upstream_known.clone(), granted)
        };
        match (known, granted) {
            (Some(known), _) => uri.publish_known(&known, self.id),
            (None, Some(conn)) => conn.post_get_known(uri.name()),
            (None, None) => {}
        }
    }

    /// Another local participant announced ticks. Under `Write`, tell the
    /// upstream about the ones it lacks so it can pull them.
    fn on_known(&self, uri: &Arc<Uri>, ticks: &TickSet, _source: u64) {
        let (conn, fresh) = {
            let state = self.state.lock();
            let Some(conn) = state.writable() else {
                return;
            };
            let fresh: TickSet = match &state.upstream_known {
                Some(known) => ticks.iter().filter(|t| !known.contains(*t)).collect(),
                None => ticks.clone(),
            };
            (conn, fresh)
        };
        if !fresh.is_empty() {
            conn.post_known(uri.name(), fresh);
        }
    }

    fn get_block(&self, uri: &Arc<Uri>, tick: Tick) {
        let Some(conn) = self.state.lock().connection.clone() else {
            return;
        };
        let provider = Arc::new(UpstreamFetch {
            id: self.id,
            resource: self.name.clone(),
            connection: conn.clone(),
        });
        if uri.in_flight().starting(uri.id(), tick, provider) {
            conn.post_get_block(uri.name(), tick);
        }
    }

    fn on_block(&self, uri: &Arc<Uri>, block: &Block, origin: Origin) {
        if origin.source == self.id {
            return;
        }
        let conn = {
            let state = self.state.lock();
            let upstream_has = state
                .upstream_known
                .as_ref()
                .map(|k| k.contains(block.tick))
                .unwrap_or(false);
            if upstream_has {
                return;
            }
            state.writable()
        };
        if let Some(conn) = conn {
            conn.post_block(uri, block.clone().with_requested(false));
        }
    }

    fn acknowledges(&self) -> bool {
        true
    }

    fn close(&self, uri: &Arc<Uri>) {
        let conn = self.state.lock().connection.take();
        if let Some(conn) = conn {
            conn.post_unsubscribe(uri.name());
        }
        uri.in_flight().provider_lost(self.id);
    }
}

/// Provider record for a GET_BLOCK sent upstream.
struct UpstreamFetch {
    id: u64,
    resource: Arc<str>,
    connection: Arc<ConnectionHandle>,
}

impl BlockProvider for UpstreamFetch {
    fn provider_id(&self) -> u64 {
        self.id
    }

    fn cancel(&self, tick: Tick) {
        self.connection.post_cancel(&self.resource, tick);
    }
}
