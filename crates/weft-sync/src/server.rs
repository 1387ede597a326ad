//! Server side of the protocol: accepts downstream connections and serves
//! the hubs of a [`UriRegistry`] to them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use weft_perms::PermissionPolicy;

use crate::command::Command;
use crate::config::SyncConfig;
use crate::connection::{ConnectionEngine, ConnectionHandle, Dispatch};
use crate::driver::drive;
use crate::error::Result;
use crate::transport::Acceptor;
use crate::uri::{Uri, UriId, UriRegistry};
use crate::view::ServerView;

pub struct Server {
    registry: Arc<UriRegistry>,
    policy: Arc<dyn PermissionPolicy>,
    config: SyncConfig,
    views: DashMap<UriId, (Arc<Uri>, Arc<ServerView>)>,
    connections: DashMap<u64, Arc<ConnectionHandle>>,
}

impl Server {
    pub fn new(
        registry: Arc<UriRegistry>,
        policy: Arc<dyn PermissionPolicy>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            policy,
            config,
            views: DashMap::new(),
            connections: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<UriRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The server view attached to `uri`, if any connection touched it.
    pub fn view(&self, uri: &Uri) -> Option<Arc<ServerView>> {
        self.views.get(&uri.id()).map(|e| e.1.clone())
    }

    /// A sans-IO engine for one new downstream connection.
    pub fn engine(self: &Arc<Self>) -> ConnectionEngine {
        let handle = ConnectionHandle::new(&self.config);
        self.connections.insert(handle.id(), handle.clone());
        tracing::debug!(connection = handle.id(), "downstream connected");
        ConnectionEngine::new(handle, self.clone(), &self.config)
    }

    /// Serve one stream on a background task.
    pub fn accept<S>(self: &Arc<Self>, stream: S) -> JoinHandle<Result<()>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let engine = self.engine();
        tokio::spawn(drive(engine, stream))
    }

    /// Accept streams until the acceptor is exhausted.
    pub async fn serve<A: Acceptor>(self: Arc<Self>, mut acceptor: A) {
        while let Some(stream) = acceptor.accept().await {
            self.accept(stream);
        }
        tracing::debug!("acceptor closed");
    }

    /// Close every downstream connection.
    pub fn close_all(&self) {
        for conn in self.connections.iter() {
            conn.close();
        }
    }

    fn server_view(&self, uri: &Arc<Uri>) -> Arc<ServerView> {
        self.views
            .entry(uri.id())
            .or_insert_with(|| {
                let view = ServerView::new(self.policy.clone());
                uri.add_view(view.clone());
                (uri.clone(), view)
            })
            .1
            .clone()
    }
}

impl Dispatch for Server {
    fn resolve(&self, conn: &Arc<ConnectionHandle>, name: &str) -> Option<Arc<Uri>> {
        match self.registry.resolve(name) {
            Some(uri) => {
                self.server_view(&uri);
                Some(uri)
            }
            None => {
                conn.post_unresolved(name);
                None
            }
        }
    }

    fn on_command(&self, conn: &Arc<ConnectionHandle>, uri: &Arc<Uri>, command: Command) {
        self.server_view(uri).handle(conn, uri, command);
    }

    fn on_disconnect(&self, conn: &Arc<ConnectionHandle>) {
        self.connections.remove(&conn.id());
        let views: Vec<(Arc<Uri>, Arc<ServerView>)> =
            self.views.iter().map(|e| e.value().clone()).collect();
        for (uri, view) in views {
            view.disconnect(conn, &uri);
        }
        let in_flight = self.registry.in_flight();
        in_flight.provider_lost(conn.id());
        in_flight.drop_connection(conn.id());
        tracing::debug!(connection = conn.id(), "downstream disconnected");
    }
}
