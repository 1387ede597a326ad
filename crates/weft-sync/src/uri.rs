//! Per-resource hub and the registry that creates hubs on demand.
//!
//! A [`Uri`] ties together everything that knows about one resource in this
//! process: the views that move its blocks between locations and the
//! listeners (open resources) that consume them. Every event a participant
//! publishes fans out to all the others. Participant lists are snapshotted
//! before fan-out, so callbacks are free to publish again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use weft_core::{Block, Tick, TickSet};
use weft_perms::Permission;

use crate::in_flight::InFlight;
use crate::view::View;

/// Process-unique id of a [`Uri`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UriId(u64);

impl UriId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        UriId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a block entered the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    /// Id of the view or listener that published it.
    pub source: u64,
    /// Connection it arrived on, for views that serve several.
    pub connection: Option<u64>,
}

impl Origin {
    pub fn local(source: u64) -> Self {
        Self {
            source,
            connection: None,
        }
    }

    pub fn connection(source: u64, connection: u64) -> Self {
        Self {
            source,
            connection: Some(connection),
        }
    }
}

/// Consumer of a resource's events. Implemented by open resources.
pub trait UriListener: Send + Sync {
    fn listener_id(&self) -> u64;

    fn on_known(&self, uri: &Arc<Uri>, ticks: &TickSet, source: u64);

    fn on_block(&self, uri: &Arc<Uri>, block: &Block, origin: Origin);

    fn on_ack(&self, uri: &Arc<Uri>, tick: Tick, source: u64);

    fn on_permission(&self, uri: &Arc<Uri>, permission: Permission, source: u64);

    fn on_unresolved(&self, uri: &Arc<Uri>, source: u64);

    /// Ticks this listener holds.
    fn known(&self) -> TickSet;

    /// A block this listener can serve without fetching.
    fn local_block(&self, tick: Tick) -> Option<Block>;
}

pub struct Uri {
    id: UriId,
    name: Arc<str>,
    in_flight: Arc<InFlight>,
    views: RwLock<Vec<Arc<dyn View>>>,
    listeners: RwLock<Vec<Arc<dyn UriListener>>>,
}

impl Uri {
    pub fn new(name: &str, in_flight: Arc<InFlight>, views: Vec<Arc<dyn View>>) -> Arc<Self> {
        Arc::new(Self {
            id: UriId::next(),
            name: Arc::from(name),
            in_flight,
            views: RwLock::new(views),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> UriId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Participants
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_view(&self, view: Arc<dyn View>) {
        let mut views = self.views.write();
        if !views.iter().any(|v| v.view_id() == view.view_id()) {
            views.push(view);
        }
    }

    pub fn views(&self) -> Vec<Arc<dyn View>> {
        self.views.read().clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn UriListener>) {
        let mut listeners = self.listeners.write();
        if !listeners
            .iter()
            .any(|l| l.listener_id() == listener.listener_id())
        {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.listener_id() != id);
        listeners.len() < before
    }

    pub fn listeners(&self) -> Vec<Arc<dyn UriListener>> {
        self.listeners.read().clone()
    }

    /// Views whose known set a new listener must wait for.
    pub fn announcing_views(&self) -> Vec<u64> {
        self.views
            .read()
            .iter()
            .filter(|v| v.announces_known())
            .map(|v| v.view_id())
            .collect()
    }

    /// Views that acknowledge durable storage of uploaded blocks.
    pub fn acknowledging_views(&self) -> Vec<u64> {
        self.views
            .read()
            .iter()
            .filter(|v| v.acknowledges())
            .map(|v| v.view_id())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask every view for its known set. Answers arrive via
    /// [`Uri::publish_known`], possibly before this returns.
    pub fn get_known(self: &Arc<Self>) {
        for view in self.views() {
            view.get_known(self);
        }
    }

    /// Ask every view to fetch a block.
    pub fn fetch(self: &Arc<Self>, tick: Tick) {
        for view in self.views() {
            view.get_block(self, tick);
        }
    }

    pub fn cancel_fetch(self: &Arc<Self>, tick: Tick) {
        for view in self.views() {
            view.cancel_block(self, tick);
        }
    }

    /// Ticks held by listeners.
    pub fn local_known(&self) -> TickSet {
        let mut known = TickSet::new();
        for listener in self.listeners() {
            known.union_with(&listener.known());
        }
        known
    }

    /// Ticks stored by views that hold blocks.
    pub fn stored_known(&self) -> TickSet {
        let mut known = TickSet::new();
        for view in self.views() {
            if let Some(ticks) = view.stored_known(self) {
                known.union_with(&ticks);
            }
        }
        known
    }

    /// A block any listener or storing view can hand over right now.
    pub fn local_block(&self, tick: Tick) -> Option<Block> {
        self.listeners()
            .iter()
            .find_map(|l| l.local_block(tick))
            .or_else(|| self.views().iter().find_map(|v| v.read_block(self, tick)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────

    pub fn publish_known(self: &Arc<Self>, ticks: &TickSet, source: u64) {
        for view in self.views() {
            if view.view_id() != source {
                view.on_known(self, ticks, source);
            }
        }
        for listener in self.listeners() {
            if listener.listener_id() != source {
                listener.on_known(self, ticks, source);
            }
        }
    }

    /// A block new to this process: wake fetches and fan out to everyone.
    pub fn publish_block(self: &Arc<Self>, block: &Block, origin: Origin) {
        self.in_flight.deliver(self.id, block);
        for view in self.views() {
            view.on_block(self, block, origin);
        }
        for listener in self.listeners() {
            if listener.listener_id() != origin.source {
                listener.on_block(self, block, origin);
            }
        }
    }

    /// A block read back from storage: only waiting fetches see it.
    pub fn deliver(&self, block: &Block) -> usize {
        self.in_flight.deliver(self.id, block)
    }

    pub fn publish_ack(self: &Arc<Self>, tick: Tick, source: u64) {
        for view in self.views() {
            if view.view_id() != source {
                view.on_ack(self, tick, source);
            }
        }
        for listener in self.listeners() {
            listener.on_ack(self, tick, source);
        }
    }

    pub fn publish_permission(self: &Arc<Self>, permission: Permission, source: u64) {
        for listener in self.listeners() {
            listener.on_permission(self, permission, source);
        }
    }

    pub fn publish_unresolved(self: &Arc<Self>, source: u64) {
        for listener in self.listeners() {
            listener.on_unresolved(self, source);
        }
    }

    /// Tear down: tell every view the resource is going away.
    pub fn close(self: &Arc<Self>) {
        for view in self.views() {
            view.close(self);
        }
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uri")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("views", &self.views.read().len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Contributes views for the resource names it recognizes.
pub trait UriHandler: Send + Sync {
    /// Views for `name`, or `None` if this handler does not serve it.
    fn views(&self, name: &str) -> Option<Vec<Arc<dyn View>>>;

    /// Called once the hub exists, for handlers that track their hubs.
    fn opened(&self, _uri: &Arc<Uri>) {}

    fn closed(&self, _uri: &Arc<Uri>) {}
}

/// Name -> hub cache backed by a chain of handlers.
///
/// Every handler that recognizes a name contributes views, so an origin
/// handler and an upstream handler together make a caching relay. A name
/// no handler recognizes is unresolved.
pub struct UriRegistry {
    handlers: Vec<Arc<dyn UriHandler>>,
    uris: DashMap<String, Arc<Uri>>,
    in_flight: Arc<InFlight>,
}

impl UriRegistry {
    pub fn new(handlers: Vec<Arc<dyn UriHandler>>) -> Self {
        Self {
            handlers,
            uris: DashMap::new(),
            in_flight: Arc::new(InFlight::new()),
        }
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Existing hub for `name`, without creating one.
    pub fn get(&self, name: &str) -> Option<Arc<Uri>> {
        self.uris.get(name).map(|u| u.value().clone())
    }

    /// Hub for `name`, created through the handler chain if needed.
    pub fn resolve(&self, name: &str) -> Option<Arc<Uri>> {
        if let Some(uri) = self.get(name) {
            return Some(uri);
        }

        let mut views = Vec::new();
        let mut contributors = Vec::new();
        for handler in &self.handlers {
            if let Some(mut contributed) = handler.views(name) {
                views.append(&mut contributed);
                contributors.push(handler.clone());
            }
        }
        if contributors.is_empty() {
            tracing::debug!(name, "unresolved resource name");
            return None;
        }

        let candidate = Uri::new(name, self.in_flight.clone(), views);
        let uri = self
            .uris
            .entry(name.to_string())
            .or_insert_with(|| candidate.clone())
            .value()
            .clone();
        if Arc::ptr_eq(&uri, &candidate) {
            for handler in &contributors {
                handler.opened(&uri);
            }
            tracing::debug!(name, views = uri.views().len(), "resource hub opened");
        }
        Some(uri)
    }

    /// Drop a hub and let its views and handlers release it.
    pub fn close(&self, name: &str) -> bool {
        let Some((_, uri)) = self.uris.remove(name) else {
            return false;
        };
        uri.close();
        for handler in &self.handlers {
            handler.closed(&uri);
        }
        true
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.uris.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for UriRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UriRegistry")
            .field("handlers", &self.handlers.len())
            .field("uris", &self.uris.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_flight::next_actor_id;
    use parking_lot::Mutex;

    /// Records every callback it receives.
    struct Recorder {
        id: u64,
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_actor_id(),
                events: Mutex::new(Vec::new()),
            })
        }
    }

    impl View for Recorder {
        fn view_id(&self) -> u64 {
            self.id
        }
        fn get_known(&self, _uri: &Arc<Uri>) {
            self.events.lock().push("get_known".into());
        }
        fn on_known(&self, _uri: &Arc<Uri>, ticks: &TickSet, _source: u64) {
            self.events.lock().push(format!("known:{}", ticks.len()));
        }
        fn get_block(&self, _uri: &Arc<Uri>, tick: Tick) {
            self.events.lock().push(format!("get:{}", tick.time()));
        }
        fn on_block(&self, _uri: &Arc<Uri>, block: &Block, origin: Origin) {
            if origin.source != self.id {
                self.events.lock().push(format!("block:{}", block.tick.time()));
            }
        }
    }

    struct Prefix(&'static str);

    impl UriHandler for Prefix {
        fn views(&self, name: &str) -> Option<Vec<Arc<dyn View>>> {
            name.starts_with(self.0)
                .then(|| vec![Recorder::new() as Arc<dyn View>])
        }
    }

    #[test]
    fn test_registry_caches_and_chains() {
        let registry = UriRegistry::new(vec![Arc::new(Prefix("a/")), Arc::new(Prefix("a/b"))]);
        let one = registry.resolve("a/b/c").unwrap();
        let two = registry.resolve("a/b/c").unwrap();
        assert!(Arc::ptr_eq(&one, &two));
        assert_eq!(one.views().len(), 2);
        assert_eq!(registry.resolve("a/x").unwrap().views().len(), 1);
        assert!(registry.resolve("zzz").is_none());
        assert_eq!(registry.names(), vec!["a/b/c".to_string(), "a/x".to_string()]);
        assert!(registry.close("a/x"));
        assert!(registry.get("a/x").is_none());
    }

    #[test]
    fn test_publish_skips_source() {
        let (a, b) = (Recorder::new(), Recorder::new());
        let views: Vec<Arc<dyn View>> = vec![a.clone(), b.clone()];
        let uri = Uri::new("doc", Arc::new(InFlight::new()), views);
        let ticks = TickSet::new();
        uri.publish_known(&ticks, a.id);
        assert!(a.events.lock().is_empty());
        assert_eq!(*b.events.lock(), vec!["known:0".to_string()]);
    }

    #[test]
    fn test_fetch_reaches_every_view() {
        let (a, b) = (Recorder::new(), Recorder::new());
        let views: Vec<Arc<dyn View>> = vec![a.clone(), b.clone()];
        let uri = Uri::new("doc", Arc::new(InFlight::new()), views);
        let peer = weft_core::Peer::get_or_create(weft_core::PeerUid::derive("uri")).unwrap();
        uri.fetch(Tick::new(peer, 3).unwrap());
        assert_eq!(*a.events.lock(), vec!["get:3".to_string()]);
        assert_eq!(*b.events.lock(), vec!["get:3".to_string()]);
    }
}
