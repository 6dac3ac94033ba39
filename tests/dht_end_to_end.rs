use bytes::Bytes;
use dhtrpc::dht::{
    Commit, Dht, DhtOptions, HandlerReply, HandlerTable, IncomingRequest, NodeId, QueryOptions,
    RpcOptions,
};
use dhtrpc::wire::status;
use futures::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

type Store = Arc<Mutex<HashMap<NodeId, Bytes>>>;

/// Content-addressed storage: values live under the sha256 of their bytes.
fn immutable_handlers(store: Store) -> HandlerTable {
    let puts = store.clone();
    HandlerTable::new()
        .on("immutable_put", move |req: &IncomingRequest| {
            let Some(target) = req.target else {
                return HandlerReply::error(status::INVALID_PAYLOAD);
            };
            // Without a token this is just the lookup phase.
            if req.token.is_none() {
                return HandlerReply::ok();
            }
            let hash: [u8; 32] = Sha256::digest(&req.value).into();
            if hash != target.0 {
                return HandlerReply::error(status::INVALID_PAYLOAD);
            }
            puts.lock().insert(target, req.value.clone());
            HandlerReply::ok()
        })
        .on("immutable_get", move |req: &IncomingRequest| {
            let value = req.target.and_then(|t| store.lock().get(&t).cloned());
            match value {
                Some(value) => HandlerReply::value(value),
                None => HandlerReply::ok(),
            }
        })
}

async fn spawn_node(bootstrap: Option<&Arc<Dht>>) -> (Arc<Dht>, Store) {
    let store: Store = Arc::default();
    let options = DhtOptions {
        host: Ipv4Addr::LOCALHOST,
        bootstrap: bootstrap
            .map(|b| vec![SocketAddr::V4(b.local_addr())])
            .unwrap_or_default(),
        tick_interval: Duration::from_secs(60),
        rpc: RpcOptions {
            drain_interval: Duration::from_millis(20),
            ..Default::default()
        },
        handlers: immutable_handlers(store.clone()),
        ..Default::default()
    };
    let dht = Dht::bind(options).await.unwrap();
    dht.start();
    if bootstrap.is_some() {
        dht.bootstrap().await.unwrap();
    }
    (dht, store)
}

#[tokio::test]
async fn test_put_then_get_across_nodes() {
    let (bootstrap, bootstrap_store) = spawn_node(None).await;
    let mut nodes = Vec::new();
    let mut stores = vec![bootstrap_store];
    for _ in 0..5 {
        let (node, store) = spawn_node(Some(&bootstrap)).await;
        nodes.push(node);
        stores.push(store);
    }

    let value = Bytes::from_static(b"hello distributed world");
    let target = NodeId(Sha256::digest(&value).into());

    let put = nodes[0]
        .query(
            target,
            "immutable_put",
            value.clone(),
            QueryOptions::new().commit(Commit::Auto),
        )
        .finished()
        .await
        .unwrap();
    assert!(!put.is_empty());

    let stored = stores
        .iter()
        .filter(|s| s.lock().contains_key(&target))
        .count();
    assert_eq!(stored, put.len());

    let mut get = nodes[4].query(target, "immutable_get", Bytes::new(), QueryOptions::new());
    let mut found = None;
    while let Some(reply) = get.next().await {
        let reply = reply.unwrap();
        if !reply.value.is_empty() && Sha256::digest(&reply.value)[..] == target.0[..] {
            found = Some(reply.value);
            break;
        }
    }
    assert_eq!(found, Some(value));

    bootstrap.destroy();
    for node in nodes {
        node.destroy();
    }
}

#[tokio::test]
async fn test_commit_without_token_fails() {
    let (bootstrap, _) = spawn_node(None).await;
    let (node, _) = spawn_node(Some(&bootstrap)).await;

    let target = NodeId([3u8; 32]);
    let result = node
        .query(
            target,
            "immutable_put",
            Bytes::from_static(b"x"),
            QueryOptions::new().commit(Commit::custom(|_, _, _| {
                Box::pin(async { Err::<(), _>(dhtrpc::DhtError::MissingToken) })
            })),
        )
        .finished()
        .await;

    match result {
        Err(dhtrpc::DhtError::CommitFailed(inner)) => {
            assert!(matches!(*inner, dhtrpc::DhtError::MissingToken));
        }
        other => panic!("expected commit failure, got {:?}", other.map(|r| r.len())),
    }

    bootstrap.destroy();
    node.destroy();
}
