//! Upstream connection management.
//!
//! An [`Upstream`] owns the client side of one remote location: the
//! [`ClientView`]s of every hub it serves, the current connection, and the
//! retry loop that re-establishes it. Waits between attempts are drawn from
//! the configured backoff window, and connects are bounded by a timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::command::{Address, Command};
use crate::config::SyncConfig;
use crate::connection::{ConnectionEngine, ConnectionHandle, Dispatch};
use crate::driver::drive;
use crate::error::{Result, SyncError};
use crate::in_flight::next_actor_id;
use crate::transport::Transport;
use crate::uri::{Uri, UriHandler};
use crate::view::{ClientView, View};

struct Attached {
    uri: Weak<Uri>,
    view: Arc<ClientView>,
}

pub struct Upstream {
    id: u64,
    prefix: String,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    headers: Vec<(String, String)>,
    address: Option<Address>,
    views: DashMap<String, Attached>,
    connection: Mutex<Option<Arc<ConnectionHandle>>>,
    stopped: AtomicBool,
    stop: Notify,
}

impl Upstream {
    /// Serve every resource name starting with `prefix` from `transport`.
    pub fn new(prefix: impl Into<String>, transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        Self {
            id: next_actor_id(),
            prefix: prefix.into(),
            transport,
            config,
            headers: Vec::new(),
            address: None,
            views: DashMap::new(),
            connection: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    /// Headers sent at the start of every connection.
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Address reported to the upstream at the start of every connection.
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.connection.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    /// Handler that adds a [`ClientView`] to hubs under this upstream's
    /// prefix.
    pub fn handler(self: &Arc<Self>) -> Arc<dyn UriHandler> {
        Arc::new(UpstreamHandler {
            upstream: self.clone(),
        })
    }

    /// The view this upstream attached to `name`, if any.
    pub fn view(&self, name: &str) -> Option<Arc<ClientView>> {
        self.views.get(name).map(|a| a.view.clone())
    }

    /// Build an engine for a freshly opened stream and attach every view
    /// to it.
    pub fn connect_engine(self: &Arc<Self>) -> ConnectionEngine {
        let handle = ConnectionHandle::new(&self.config);
        if !self.headers.is_empty() {
            handle.post_headers(self.headers.clone());
        }
        if let Some(address) = &self.address {
            handle.post_address(address.clone());
        }
        *self.connection.lock() = Some(handle.clone());
        for entry in self.views.iter() {
            entry.view.attach(handle.clone());
        }
        tracing::info!(upstream = %self.describe(), resources = self.views.len(), "upstream attached");
        ConnectionEngine::new(handle, self.clone(), &self.config)
    }

    /// Keep a connection up until [`Upstream::stop`] or a non-retriable
    /// error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        while !self.stopped.load(Ordering::Acquire) {
            let attempt =
                tokio::time::timeout(self.config.connect_timeout, self.transport.connect()).await;
            let outcome = match attempt {
                Ok(Ok(stream)) => {
                    let engine = self.connect_engine();
                    drive(engine, stream).await
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SyncError::Timeout(format!("connect to {}", self.describe()))),
            };

            match outcome {
                Ok(()) => tracing::debug!(upstream = %self.describe(), "upstream connection ended"),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(upstream = %self.describe(), error = %e, "upstream connection failed")
                }
                Err(e) => {
                    tracing::error!(upstream = %self.describe(), error = %e, "giving up on upstream");
                    return Err(e);
                }
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let wait = self.config.retry.backoff();
            tracing::debug!(upstream = %self.describe(), ?wait, "reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.stop.notified() => break,
            }
        }
        Ok(())
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.clone().run())
    }

    /// Stop retrying and close the current connection.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop.notify_one();
        if let Some(conn) = self.connection() {
            conn.close();
        }
    }

    /// Drop the current connection without stopping the retry loop.
    pub fn disconnect(&self) {
        if let Some(conn) = self.connection() {
            conn.close();
        }
    }

    fn register(&self, name: &str) -> Arc<ClientView> {
        self.views
            .entry(name.to_string())
            .or_insert_with(|| Attached {
                uri: Weak::new(),
                view: ClientView::new(name),
            })
            .view
            .clone()
    }

    fn opened(&self, uri: &Arc<Uri>) {
        let view = {
            let Some(mut entry) = self.views.get_mut(uri.name()) else {
                return;
            };
            entry.uri = Arc::downgrade(uri);
            entry.view.clone()
        };
        if let Some(conn) = self.connection() {
            view.attach(conn);
        }
    }

    fn closed(&self, uri: &Arc<Uri>) {
        self.views.remove(uri.name());
    }
}

impl Dispatch for Upstream {
    fn resolve(&self, _conn: &Arc<ConnectionHandle>, name: &str) -> Option<Arc<Uri>> {
        let uri = self.views.get(name).and_then(|a| a.uri.upgrade());
        if uri.is_none() {
            tracing::debug!(name, "upstream sent command for a resource we do not hold");
        }
        uri
    }

    fn on_command(&self, _conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>, command: Command) {
        let view = self.views.get(uri.name()).map(|a| a.view.clone());
        if let Some(view) = view {
            view.handle(uri, command);
        }
    }

    fn on_disconnect(&self, conn: &Arc<ConnectionHandle>) {
        {
            let mut current = self.connection.lock();
            if current.as_ref().map(|c| c.id()) != Some(conn.id()) {
                return;
            }
            *current = None;
        }
        let attached: Vec<(Option<Arc<Uri>>, Arc<ClientView>)> = self
            .views
            .iter()
            .map(|a| (a.uri.upgrade(), a.view.clone()))
            .collect();
        for (uri, view) in attached {
            if let Some(uri) = uri {
                view.detach(&uri);
            }
        }
        tracing::info!(upstream = %self.describe(), "upstream detached");
    }
}

struct UpstreamHandler {
    upstream: Arc<Upstream>,
}

impl UriHandler for UpstreamHandler {
    fn views(&self, name: &str) -> Option<Vec<Arc<dyn View>>> {
        if !name.starts_with(&self.upstream.prefix) {
            return None;
        }
        Some(vec![self.upstream.register(name) as Arc<dyn View>])
    }

    fn opened(&self, uri: &Arc<Uri>) {
        self.upstream.opened(uri);
    }

    fn closed(&self, uri: &Arc<Uri>) {
        self.upstream.closed(uri);
    }
}
