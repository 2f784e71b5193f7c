//! Gossip dissemination over the in-memory network.

use concord_common::config::GossipConfig;
use concord_sync::{
    CrdtMerge, CrdtRegistry, GossipEngine, GossipHandle, GossipMessage, GossipService,
    InMemoryNetwork, NodeId, PeerStatus, StateMerge,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> GossipConfig {
    GossipConfig::default()
        .with_gossip_interval(Duration::from_millis(100))
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_suspect_timeout(Duration::from_millis(300))
        .with_dead_timeout(Duration::from_millis(300))
        .with_rpc_timeout(Duration::from_millis(50))
        .with_fanout(2)
}

fn node_ids(size: usize) -> Vec<NodeId> {
    (1..=size).map(|i| NodeId::new(format!("g{}", i))).collect()
}

/// Spawn one fully meshed service per id, building each engine's merger
/// with `merger`.
fn spawn_mesh<S, F>(
    network: &InMemoryNetwork<GossipMessage>,
    ids: &[NodeId],
    mut merger: F,
) -> Vec<GossipHandle<S>>
where
    S: StateMerge,
    F: FnMut(&NodeId) -> S,
{
    let now = tokio::time::Instant::now().into_std();
    ids.iter()
        .map(|id| {
            let mut engine =
                GossipEngine::with_merger(id.clone(), format!("mem://{}", id), fast_config(), merger(id));
            for peer in ids.iter().filter(|p| *p != id) {
                engine.add_peer(peer.clone(), format!("mem://{}", peer), BTreeMap::new(), now);
            }
            let inbox = network.register(id.clone());
            let (handle, _task) = GossipService::spawn(engine, Arc::new(network.endpoint(id.clone())), inbox);
            handle
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn keys_spread_to_every_node() {
    let network = InMemoryNetwork::new();
    let ids = node_ids(5);
    let handles = spawn_mesh(&network, &ids, |_| concord_sync::LastWriteWins);

    for (i, handle) in handles.iter().enumerate() {
        handle.set_state(format!("key-{}", i), json!(i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    for handle in &handles {
        let state = handle.all_state().await.unwrap();
        assert_eq!(state.len(), 5, "{} saw {:?}", handle.id(), state);
        let stats = handle.stats().await.unwrap();
        assert!(stats.rounds_completed > 0);
        assert_eq!(stats.alive_peers, 4);
        assert!(handle.call(|engine| engine.has_converged()).await.unwrap());
    }

    for handle in &handles {
        handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn crdt_counters_converge_to_the_sum() {
    let network = InMemoryNetwork::new();
    let ids = node_ids(3);
    let handles = spawn_mesh(&network, &ids, |id| CrdtMerge::new(CrdtRegistry::new(id.clone())));

    for (i, handle) in handles.iter().enumerate() {
        let amount = (i as u64 + 1) * 10;
        handle
            .call(move |engine| -> concord_sync::Result<()> {
                engine.merger_mut().registry_mut().g_counter("hits")?.increment(amount);
                engine.publish_crdt("hits")
            })
            .await
            .unwrap()
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    for handle in &handles {
        let value = handle
            .call(|engine| engine.merger().registry().get("hits").map(|c| c.value()))
            .await
            .unwrap();
        assert_eq!(value, Some(json!(60)), "{} has not converged", handle.id());
    }

    for handle in &handles {
        handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn isolated_node_is_declared_dead() {
    let network = InMemoryNetwork::new();
    let ids = node_ids(3);
    let handles = spawn_mesh(&network, &ids, |_| concord_sync::LastWriteWins);
    let isolated = ids[2].clone();

    network.isolate(&isolated);
    handles[0].set_state("after-split", json!(true)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    for handle in &handles[..2] {
        let target = isolated.clone();
        let status = handle
            .call(move |engine| engine.peer(&target).map(|p| p.status))
            .await
            .unwrap();
        assert_eq!(status, Some(PeerStatus::Dead), "{} still trusts {}", handle.id(), isolated);
        assert_eq!(handle.stats().await.unwrap().alive_peers, 1);
    }

    assert_eq!(handles[1].get_state("after-split").await.unwrap(), Some(json!(true)));
    assert_eq!(handles[2].get_state("after-split").await.unwrap(), None);

    for handle in &handles {
        handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn healed_partition_resyncs() {
    let network = InMemoryNetwork::new();
    let ids = node_ids(3);
    let handles = spawn_mesh(&network, &ids, |_| concord_sync::LastWriteWins);

    network.isolate(&ids[2]);
    handles[0].set_state("after-split", json!("written-in-majority")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handles[0].stats().await.unwrap().alive_peers, 1);
    assert_eq!(handles[2].stats().await.unwrap().alive_peers, 0);

    network.heal();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(
        handles[2].get_state("after-split").await.unwrap(),
        Some(json!("written-in-majority"))
    );
    for handle in &handles {
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.alive_peers, 2, "{} sees {:?}", handle.id(), stats);
        assert_eq!(stats.dead_peers, 0);
    }

    for handle in &handles {
        handle.shutdown();
    }
}
