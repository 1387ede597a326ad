//! Views: the adapters that move a resource's blocks between locations.
//!
//! - [`MemoryView`] - backs a resource with a [`weft_store::Store`], as origin or cache
//! - [`ClientView`] - forwards to and from an upstream connection
//! - [`ServerView`] - serves downstream connections subscribed to the resource
//!
//! Views are called synchronously from inside the hub's fan-out and from
//! connection dispatch. They must not block and must not hold their own
//! locks while calling back into the hub.

use std::sync::Arc;

use weft_core::{Block, Tick, TickSet};

use crate::uri::{Origin, Uri};

pub mod client;
pub mod memory;
pub mod server;

pub use client::ClientView;
pub use memory::{MemoryOrigin, MemoryRole, MemoryView};
pub use server::ServerView;

pub trait View: Send + Sync {
    fn view_id(&self) -> u64;

    /// Report the known set through [`Uri::publish_known`] when available.
    fn get_known(&self, uri: &Arc<Uri>);

    fn on_known(&self, uri: &Arc<Uri>, ticks: &TickSet, source: u64);

    /// Try to obtain a block for the fetch registered in the hub's in-flight
    /// table.
    fn get_block(&self, uri: &Arc<Uri>, tick: Tick);

    /// A block entered the hub. Views skip blocks they published themselves.
    fn on_block(&self, uri: &Arc<Uri>, block: &Block, origin: Origin);

    fn cancel_block(&self, _uri: &Arc<Uri>, _tick: Tick) {}

    fn on_ack(&self, _uri: &Arc<Uri>, _tick: Tick, _source: u64) {}

    /// Whether listeners should wait for this view's known set before they
    /// consider themselves up to date.
    fn announces_known(&self) -> bool {
        true
    }

    /// Whether this view publishes ACKs for blocks it makes durable.
    fn acknowledges(&self) -> bool {
        false
    }

    /// Ticks held in local storage, for views that have any.
    fn stored_known(&self, _uri: &Uri) -> Option<TickSet> {
        None
    }

    /// Read a block from local storage without fetching.
    fn read_block(&self, _uri: &Uri, _tick: Tick) -> Option<Block> {
        None
    }

    fn close(&self, _uri: &Arc<Uri>) {}
}
