//! The Workspace: one local peer and the resources it has open.
//!
//! A workspace ties together the local peer identity and clock, the
//! registry of resource hubs, the locations that back them (memory stores
//! and upstream connections) and the snapshot that resources commit into.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use weft_core::{Clock, Peer, Tick, VersionSet};
use weft_perms::PermissionPolicy;
use weft_store::Store;
use weft_sync::{MemoryOrigin, Server, Transport, UriHandler, UriRegistry, Upstream};

use crate::config::{ClockMode, WorkspaceConfig};
use crate::error::{Result, WeftError};
use crate::resource::{CancelReason, Resource, ResourceState};
use crate::snapshot::{MemorySnapshot, Snapshot};

struct UpstreamSpec {
    prefix: String,
    transport: Arc<dyn Transport>,
    headers: Vec<(String, String)>,
}

/// Builder for a [`Workspace`].
#[derive(Default)]
pub struct WorkspaceBuilder {
    config: WorkspaceConfig,
    peer: Option<Peer>,
    snapshot: Option<Arc<dyn Snapshot>>,
    handlers: Vec<Arc<dyn UriHandler>>,
    upstreams: Vec<UpstreamSpec>,
}

impl WorkspaceBuilder {
    pub fn config(mut self, config: WorkspaceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `peer` as the local identity instead of a random one.
    pub fn peer(mut self, peer: Peer) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn snapshot(mut self, snapshot: Arc<dyn Snapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Back names under `prefix` with `store` as their durable origin.
    pub fn memory_origin(self, prefix: impl Into<String>, store: Arc<dyn Store>) -> Self {
        self.handler(Arc::new(MemoryOrigin::new(prefix, store)))
    }

    /// Cache names under `prefix` in `store` without acknowledging them.
    pub fn memory_cache(self, prefix: impl Into<String>, store: Arc<dyn Store>) -> Self {
        self.handler(Arc::new(MemoryOrigin::cache(prefix, store)))
    }

    pub fn handler(mut self, handler: Arc<dyn UriHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Replicate names under `prefix` with the location behind `transport`.
    pub fn upstream(self, prefix: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.upstream_with_headers(prefix, transport, Vec::new())
    }

    pub fn upstream_with_headers(
        mut self,
        prefix: impl Into<String>,
        transport: Arc<dyn Transport>,
        headers: Vec<(String, String)>,
    ) -> Self {
        self.upstreams.push(UpstreamSpec {
            prefix: prefix.into(),
            transport,
            headers,
        });
        self
    }

    pub fn build(self) -> Result<Workspace> {
        self.config.validate()?;
        let peer = match self.peer {
            Some(peer) => peer,
            None => Peer::random()?,
        };
        let clock = match self.config.clock {
            ClockMode::System => Clock::system(peer),
            ClockMode::Logical => Clock::logical(peer, 0),
        };

        let upstreams: Vec<Arc<Upstream>> = self
            .upstreams
            .into_iter()
            .map(|spec| {
                Arc::new(
                    Upstream::new(spec.prefix, spec.transport, self.config.sync.clone())
                        .with_headers(spec.headers),
                )
            })
            .collect();

        let mut handlers = self.handlers;
        handlers.extend(upstreams.iter().map(|u| u.handler()));

        tracing::info!(peer = %peer.uid(), upstreams = upstreams.len(), "workspace created");
        Ok(Workspace {
            peer,
            clock: Arc::new(clock),
            registry: Arc::new(UriRegistry::new(handlers)),
            snapshot: self
                .snapshot
                .unwrap_or_else(|| Arc::new(MemorySnapshot::new())),
            upstreams,
            resources: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            config: self.config,
        })
    }
}

pub struct Workspace {
    peer: Peer,
    clock: Arc<Clock>,
    registry: Arc<UriRegistry>,
    snapshot: Arc<dyn Snapshot>,
    upstreams: Vec<Arc<Upstream>>,
    resources: DashMap<String, Arc<Resource>>,
    tasks: Mutex<Vec<JoinHandle<weft_sync::Result<()>>>>,
    config: WorkspaceConfig,
}

impl Workspace {
    pub fn builder() -> WorkspaceBuilder {
        WorkspaceBuilder::default()
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<UriRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> &Arc<dyn Snapshot> {
        &self.snapshot
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resources
    // ─────────────────────────────────────────────────────────────────────────

    /// The open resource for `name`, opening it if needed. Does not wait
    /// for it to load.
    pub fn resource(&self, name: &str) -> Result<Arc<Resource>> {
        if let Some(resource) = self.resources.get(name) {
            if !is_closed(&resource) {
                return Ok(resource.clone());
            }
        }

        let uri = self
            .registry
            .resolve(name)
            .ok_or_else(|| WeftError::NoHandler(name.to_string()))?;
        let opened = Resource::open(uri, self.clock.clone(), self.snapshot.clone());

        match self.resources.entry(name.to_string()) {
            Entry::Occupied(entry) if !is_closed(entry.get()) => {
                // Lost a race with another opener.
                let existing = entry.get().clone();
                drop(entry);
                opened.close();
                Ok(existing)
            }
            Entry::Occupied(mut entry) => {
                entry.insert(opened.clone());
                Ok(opened)
            }
            Entry::Vacant(entry) => {
                entry.insert(opened.clone());
                Ok(opened)
            }
        }
    }

    /// Open `name` and wait until it is up to date with every location
    /// that announces known ticks.
    pub async fn open(&self, name: &str) -> Result<Arc<Resource>> {
        let resource = self.resource(name)?;
        tokio::time::timeout(self.config.open_timeout, resource.wait_up_to_date())
            .await
            .map_err(|_| WeftError::Timeout(format!("opening {name}")))??;
        Ok(resource)
    }

    /// Write `versions` to `name`, opening it if needed.
    pub fn write(&self, name: &str, versions: VersionSet) -> Result<Tick> {
        self.resource(name)?.write(versions)
    }

    /// Close `name` and release its hub. Returns false if it was not open.
    pub fn close(&self, name: &str) -> bool {
        let Some((_, resource)) = self.resources.remove(name) else {
            return false;
        };
        resource.close();
        self.registry.close(name);
        true
    }

    pub fn open_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Networking
    // ─────────────────────────────────────────────────────────────────────────

    /// A server sharing this workspace's hubs, so downstream connections
    /// see the same resources this workspace holds.
    pub fn server(&self, policy: Arc<dyn PermissionPolicy>) -> Arc<Server> {
        Server::new(self.registry.clone(), policy, self.config.sync.clone())
    }

    /// Start the retry loop of every upstream. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for upstream in &self.upstreams {
            tasks.push(upstream.spawn());
        }
    }

    /// Stop every upstream and wait for their loops to end.
    pub async fn stop(&self) {
        for upstream in &self.upstreams {
            upstream.stop();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "upstream ended with error"),
                Err(e) => tracing::warn!(error = %e, "upstream task failed"),
            }
        }
    }
}

fn is_closed(resource: &Resource) -> bool {
    resource.state() == ResourceState::Cancelled(CancelReason::Closed)
}

impl Drop for Workspace {
    fn drop(&mut self) {
        for upstream in &self.upstreams {
            upstream.stop();
        }
    }
}
