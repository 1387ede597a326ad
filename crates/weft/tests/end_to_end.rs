//! End-to-end replication: client workspaces linked to an origin server,
//! driven by hand so every exchange is deterministic.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;

use weft::{Block, ResourceState, Tick, WeftError, Workspace};
use weft_perms::{Permission, StaticPolicy};
use weft_store::{MemoryStore, Store};
use weft_sync::{MemoryNetwork, MemoryOrigin, Server, SyncConfig, UriRegistry};
use weft_testkit::{
    arrival_order, block, client_workspace, init_tracing, origin, peer, tick, versions,
    write_plan, BlockBuilder, Link, PlannedWrite,
};

fn writable() -> Arc<StaticPolicy> {
    Arc::new(StaticPolicy(Permission::Write))
}

fn store_block(store: &MemoryStore, name: &str, block: &Block) {
    store.put(name, block.tick, block.payload()).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetching
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_client_fetches_stored_block() {
    init_tracing();
    let (store, server) = origin(writable());
    let t1 = tick("e2e-fetch-origin", 1);
    store_block(&store, "doc", &block(t1, &[(1, "hello")]));

    let workspace = client_workspace("e2e-fetch-client");
    let doc = workspace.resource("doc").unwrap();
    assert_eq!(doc.state(), ResourceState::Loading);

    let mut link = Link::new(&workspace.upstreams()[0], &server);
    link.pump().unwrap();

    assert_eq!(doc.state(), ResourceState::UpToDate);
    assert_eq!(doc.ordered_ticks(), vec![t1]);
    assert_eq!(doc.value(1).unwrap(), Bytes::from_static(b"hello"));
    assert_eq!(doc.permission(), Some(Permission::Write));
    assert_eq!(doc.requested_count(), 0);
    assert!(!doc.uri().in_flight().is_pending(doc.uri().id(), t1));
    assert_eq!(link.server.handle().unacked_count(), 0);
}

#[test]
fn test_out_of_order_fetch_waits_for_dependencies() {
    let (store, server) = origin(writable());
    let base = tick("e2e-chain", 1);
    let child = tick("e2e-chain", 2);
    store_block(&store, "doc", &block(base, &[(1, "base")]));
    store_block(
        &store,
        "doc",
        &BlockBuilder::new(child)
            .deps(&[base])
            .after(&[base])
            .generation(2)
            .writes(&[(2, "child")])
            .build(),
    );

    let workspace = client_workspace("e2e-chain-client");
    let doc = workspace.resource("doc").unwrap();
    let mut link = Link::new(&workspace.upstreams()[0], &server);
    link.pump().unwrap();

    assert_eq!(doc.ordered_ticks(), vec![base, child]);
    assert_eq!(doc.pending_count(), 0);
    assert_eq!(doc.state(), ResourceState::UpToDate);
}

// ─────────────────────────────────────────────────────────────────────────────
// Writing
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_concurrent_offline_writes_converge() {
    init_tracing();
    let (store, server) = origin(writable());
    let alice = client_workspace("e2e-alice");
    let bob = client_workspace("e2e-bob");

    let a_doc = alice.resource("doc").unwrap();
    let b_doc = bob.resource("doc").unwrap();
    let ta = a_doc.write(versions(&[(1, "a"), (3, "a")])).unwrap();
    let tb = b_doc.write(versions(&[(2, "b"), (3, "b")])).unwrap();

    // Nothing is connected yet: both writes wait for an acknowledgement.
    assert_eq!(a_doc.unacknowledged(), vec![ta]);
    assert_eq!(b_doc.unacknowledged(), vec![tb]);

    let mut links = vec![
        Link::new(&alice.upstreams()[0], &server),
        Link::new(&bob.upstreams()[0], &server),
    ];
    Link::pump_all(&mut links).unwrap();

    let expected = if peer("e2e-alice").uid() < peer("e2e-bob").uid() {
        vec![ta, tb]
    } else {
        vec![tb, ta]
    };
    assert_eq!(a_doc.ordered_ticks(), expected);
    assert_eq!(b_doc.ordered_ticks(), expected);
    assert_eq!(a_doc.state_hash(), b_doc.state_hash());
    assert_eq!(a_doc.values(), b_doc.values());
    assert_eq!(a_doc.value(1).unwrap(), Bytes::from_static(b"a"));
    assert_eq!(a_doc.value(2).unwrap(), Bytes::from_static(b"b"));

    assert!(a_doc.unacknowledged().is_empty());
    assert!(b_doc.unacknowledged().is_empty());
    assert!(store.get("doc", ta).unwrap().is_some());
    assert!(store.get("doc", tb).unwrap().is_some());
    for link in &links {
        assert_eq!(link.server.handle().unacked_count(), 0);
    }
}

#[test]
fn test_concurrent_order_ignores_generation() {
    let (_, server) = origin(writable());
    let alice = client_workspace("e2e-gen-alice");
    let bob = client_workspace("e2e-gen-bob");
    let a_doc = alice.resource("doc").unwrap();
    let b_doc = bob.resource("doc").unwrap();

    // Alice writes twice, so her second block carries a higher generation
    // than Bob's concurrent one.
    let a1 = a_doc.write(versions(&[(1, "a")])).unwrap();
    let a2 = a_doc.write(versions(&[(3, "a")])).unwrap();
    let b1 = b_doc.write(versions(&[(2, "b"), (3, "b")])).unwrap();

    let mut links = vec![
        Link::new(&alice.upstreams()[0], &server),
        Link::new(&bob.upstreams()[0], &server),
    ];
    Link::pump_all(&mut links).unwrap();

    let (expected, winner) = if peer("e2e-gen-alice").uid() < peer("e2e-gen-bob").uid() {
        (vec![a1, a2, b1], "b")
    } else {
        (vec![b1, a1, a2], "a")
    };
    assert_eq!(a_doc.ordered_ticks(), expected);
    assert_eq!(b_doc.ordered_ticks(), expected);
    assert_eq!(a_doc.value(3).unwrap(), Bytes::from(winner));
    assert_eq!(a_doc.state_hash(), b_doc.state_hash());
}

#[test]
fn test_superseding_write_masks_and_stubs() {
    let (store, server) = origin(writable());
    let alice = client_workspace("e2e-mask-alice");
    let bob = client_workspace("e2e-mask-bob");
    let a_doc = alice.resource("doc").unwrap();
    let b_doc = bob.resource("doc").unwrap();
    let mut links = vec![
        Link::new(&alice.upstreams()[0], &server),
        Link::new(&bob.upstreams()[0], &server),
    ];
    Link::pump_all(&mut links).unwrap();

    let first = a_doc.write(versions(&[(1, "a1"), (2, "a2")])).unwrap();
    Link::pump_all(&mut links).unwrap();
    assert_eq!(b_doc.ordered_ticks(), vec![first]);

    let second = b_doc.write(versions(&[(1, "b1"), (2, "b2")])).unwrap();
    assert_eq!(b_doc.ordered_ticks(), vec![second]);
    Link::pump_all(&mut links).unwrap();

    assert_eq!(a_doc.ordered_ticks(), vec![second]);
    assert_eq!(a_doc.value(2).unwrap(), Bytes::from_static(b"b2"));
    assert_eq!(a_doc.state_hash(), b_doc.state_hash());

    // The origin keeps the superseded tick, without its versions.
    let stub = store.get("doc", first).unwrap().unwrap();
    let body = Block::new(first, stub).body().unwrap();
    assert!(body.versions.is_empty());
    assert!(store.known("doc").unwrap().contains(first));
}

#[test]
fn test_read_only_writes_stay_local() {
    let (store, server) = origin(Arc::new(StaticPolicy(Permission::Read)));
    let workspace = client_workspace("e2e-read-only");
    let doc = workspace.resource("doc").unwrap();
    let mut link = Link::new(&workspace.upstreams()[0], &server);
    link.pump().unwrap();

    let t = doc.write(versions(&[(1, "local")])).unwrap();
    link.pump().unwrap();

    assert_eq!(doc.permission(), Some(Permission::Read));
    assert_eq!(doc.value(1).unwrap(), Bytes::from_static(b"local"));
    assert_eq!(doc.unacknowledged(), vec![t]);
    assert!(store.get("doc", t).unwrap().is_none());
}

#[test]
fn test_malformed_block_is_discarded() {
    let workspace = client_workspace("e2e-malformed");
    let doc = workspace.resource("doc").unwrap();
    let t = tick("e2e-malformed-other", 4);
    doc.receive(Block::new(t, Bytes::from_static(&[0xff, 0x00, 0x13])));

    assert!(!doc.applied().contains(t));
    assert_eq!(doc.pending_count(), 0);
    assert!(!doc.state().is_cancelled());
}

#[test]
fn test_offline_missing_dependency_stays_pending() {
    let workspace = client_workspace("e2e-offline-missing");
    let doc = workspace.resource("doc").unwrap();
    let base = tick("e2e-offline-writer", 1);
    let child = tick("e2e-offline-writer", 2);
    let child_block = BlockBuilder::new(child)
        .deps(&[base])
        .after(&[base])
        .generation(2)
        .writes(&[(1, "x")])
        .build();

    doc.receive(child_block);

    // Nobody can provide the dependency: the fetch fails once and is not
    // retried on its own.
    assert_eq!(doc.pending_count(), 1);
    assert_eq!(doc.requested_count(), 0);
    assert!(doc.failed().contains(base));
    assert_eq!(doc.state(), ResourceState::Pending);

    doc.receive(block(base, &[(2, "y")]));
    assert_eq!(doc.pending_count(), 0);
    assert!(doc.failed().is_empty());
    assert_eq!(doc.ordered_ticks(), vec![base, child]);
}

#[test]
fn test_memory_miss_leaves_dependency_pending() {
    let store = Arc::new(MemoryStore::new());
    let workspace = client_workspace_with_store("e2e-memory-miss", store.clone());
    let doc = workspace.resource("doc").unwrap();
    assert_eq!(doc.state(), ResourceState::UpToDate);

    let base = tick("e2e-memory-miss-writer", 1);
    let child = BlockBuilder::new(tick("e2e-memory-miss-writer", 2))
        .deps(&[base])
        .after(&[base])
        .generation(2)
        .writes(&[(1, "x")])
        .build();
    doc.receive(child);

    assert_eq!(doc.state(), ResourceState::Pending);
    assert_eq!(doc.requested_count(), 0);
    assert!(doc.failed().contains(base));
    assert!(!doc.uri().in_flight().is_pending(doc.uri().id(), base));
}

#[test]
fn test_disconnect_with_pending_dependency() {
    let (store, server) = origin(writable());
    let base = tick("e2e-lost-writer", 1);
    let child = tick("e2e-lost-writer", 2);
    // The origin holds the child but lost its dependency.
    store_block(
        &store,
        "doc",
        &BlockBuilder::new(child)
            .deps(&[base])
            .after(&[base])
            .generation(2)
            .writes(&[(1, "child")])
            .build(),
    );

    let workspace = client_workspace("e2e-lost-client");
    let doc = workspace.resource("doc").unwrap();
    let mut link = Link::new(&workspace.upstreams()[0], &server);
    link.pump().unwrap();

    assert_eq!(doc.pending_count(), 1);
    assert_eq!(doc.requested_count(), 1);
    assert!(doc.uri().in_flight().is_pending(doc.uri().id(), base));

    link.close();

    assert_eq!(doc.state(), ResourceState::Pending);
    assert_eq!(doc.requested_count(), 0);
    assert!(doc.failed().contains(base));
    assert!(!doc.uri().in_flight().is_pending(doc.uri().id(), base));

    doc.receive(block(base, &[(2, "base")]));
    assert_eq!(doc.ordered_ticks(), vec![base, child]);
}

#[test]
fn test_failed_dependency_is_fetched_after_reconnect() {
    let (store, server) = origin(writable());
    let base = tick("e2e-refetch-writer", 1);
    let child = BlockBuilder::new(tick("e2e-refetch-writer", 2))
        .deps(&[base])
        .after(&[base])
        .generation(2)
        .writes(&[(1, "child")])
        .build();
    let child_tick = child.tick;

    let workspace = client_workspace("e2e-refetch-client");
    let doc = workspace.resource("doc").unwrap();
    doc.receive(child.clone());
    assert!(doc.failed().contains(base));

    store_block(&store, "doc", &block(base, &[(2, "base")]));
    store_block(&store, "doc", &child);
    let mut link = Link::new(&workspace.upstreams()[0], &server);
    link.pump().unwrap();

    assert_eq!(doc.ordered_ticks(), vec![base, child_tick]);
    assert!(doc.failed().is_empty());
    assert_eq!(doc.state(), ResourceState::UpToDate);
}

// ─────────────────────────────────────────────────────────────────────────────
// Refusals
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rejected_resource_is_cancelled() {
    let (_, server) = origin(Arc::new(StaticPolicy(Permission::Reject)));
    let workspace = client_workspace("e2e-reject");
    let doc = workspace.resource("doc").unwrap();
    let mut link = Link::new(&workspace.upstreams()[0], &server);
    link.pump().unwrap();

    let err = doc.wait_up_to_date().await.unwrap_err();
    assert!(matches!(err, WeftError::PermissionDenied(_)));
    assert!(matches!(
        doc.write(versions(&[(1, "x")])),
        Err(WeftError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_unresolved_resource_is_cancelled() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(UriRegistry::new(vec![Arc::new(MemoryOrigin::new(
        "docs/", store,
    ))]));
    let server = Server::new(registry, writable(), SyncConfig::default());

    let workspace = client_workspace("e2e-unresolved");
    let doc = workspace.resource("notes").unwrap();
    let mut link = Link::new(&workspace.upstreams()[0], &server);
    link.pump().unwrap();

    let err = doc.wait_up_to_date().await.unwrap_err();
    assert!(matches!(err, WeftError::Remote(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Over tasks
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_workspace_syncs_over_memory_network() -> anyhow::Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let (store, server) = origin(writable());
    let seeded = tick("e2e-network-origin", 1);
    store_block(&store, "doc", &block(seeded, &[(1, "seeded")]));
    tokio::spawn(server.clone().serve(network.listen("origin")));

    let workspace = Workspace::builder()
        .peer(peer("e2e-network-client"))
        .upstream("", Arc::new(network.transport("origin")))
        .build()?;
    workspace.start();

    let doc = workspace.open("doc").await?;
    assert_eq!(doc.value(1).unwrap(), Bytes::from_static(b"seeded"));

    let written = doc.write(versions(&[(2, "written")]))?;
    for _ in 0..200 {
        if doc.unacknowledged().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(doc.unacknowledged().is_empty());
    assert!(store.get("doc", written)?.is_some());

    workspace.stop().await;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Convergence
// ─────────────────────────────────────────────────────────────────────────────

fn local_workspace(seed: &str) -> Workspace {
    client_workspace_with_store(seed, Arc::new(MemoryStore::new()))
}

fn client_workspace_with_store(seed: &str, store: Arc<MemoryStore>) -> Workspace {
    Workspace::builder()
        .peer(peer(seed))
        .config(weft::WorkspaceConfig {
            clock: weft::ClockMode::Logical,
            ..Default::default()
        })
        .memory_origin("", store)
        .build()
        .unwrap()
}

/// Run `plan` over `writers` local replicas. A write marked `catch_up`
/// first hands its writer every block produced so far. Returns every
/// block in production order.
fn produce(plan: &[PlannedWrite], writers: usize) -> Vec<Block> {
    let stores: Vec<Arc<MemoryStore>> = (0..writers).map(|_| Arc::new(MemoryStore::new())).collect();
    let workspaces: Vec<Workspace> = stores
        .iter()
        .enumerate()
        .map(|(i, store)| client_workspace_with_store(&format!("e2e-conv-writer-{i}"), store.clone()))
        .collect();
    let docs: Vec<_> = workspaces
        .iter()
        .map(|w| w.resource("doc").unwrap())
        .collect();

    let mut produced: Vec<Block> = Vec::new();
    for step in plan {
        let doc = &docs[step.writer];
        if step.catch_up {
            for block in &produced {
                doc.receive(block.clone());
            }
        }
        let t: Tick = doc.write(step.versions.clone()).unwrap();
        let payload = stores[step.writer].get("doc", t).unwrap().unwrap();
        produced.push(Block::new(t, payload));
    }
    produced
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_arrival_order_does_not_change_state(
        (plan, order) in write_plan(3, 8)
            .prop_flat_map(|plan| {
                let n = plan.len();
                (Just(plan), arrival_order(n))
            })
    ) {
        let blocks = produce(&plan, 3);

        let in_order = local_workspace("e2e-conv-reader-a");
        let shuffled = local_workspace("e2e-conv-reader-b");
        let a = in_order.resource("doc").unwrap();
        let b = shuffled.resource("doc").unwrap();
        for block in &blocks {
            a.receive(block.clone());
        }
        for &i in &order {
            b.receive(blocks[i].clone());
        }

        prop_assert_eq!(a.pending_count(), 0);
        prop_assert_eq!(b.pending_count(), 0);
        prop_assert_eq!(a.applied().len(), blocks.len());
        prop_assert_eq!(b.applied().len(), blocks.len());
        prop_assert_eq!(a.ordered_ticks(), b.ordered_ticks());
        prop_assert_eq!(a.values(), b.values());
        prop_assert_eq!(a.state_hash(), b.state_hash());
    }
}
