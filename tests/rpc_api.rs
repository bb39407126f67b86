//! Marketplace RPC over a real TCP socket: a server task backed by an
//! in-process DHT, driven through the typed client.

use std::sync::{Arc, LazyLock};

use tokio::net::TcpListener;

use orcanet_market::{serve, Keypair, Market, MarketClient, MemoryDht, RpcError, User};

static KEY: LazyLock<Arc<Keypair>> =
    LazyLock::new(|| Arc::new(Keypair::generate_with_bits(1024).unwrap()));

async fn spawn_server() -> String {
    let dht = Arc::new(MemoryDht::new());
    let market = Arc::new(Market::new(KEY.clone(), dht));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = serve(listener, market).await;
    });
    addr
}

#[tokio::test]
async fn register_then_check_over_the_wire() {
    let addr = spawn_server().await;
    let mut client = MarketClient::connect(&addr).await.unwrap();

    let hash = "ab".repeat(32);
    client
        .register_file(&hash, User::new("alice", "203.0.113.4", 4001, 15))
        .await
        .unwrap();

    let holders = client.check_holders(&hash).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].name, "alice");
    assert_eq!(holders[0].price, 15);
    assert_eq!(holders[0].id, KEY.public_key_bytes());
}

#[tokio::test]
async fn unknown_file_has_no_holders() {
    let addr = spawn_server().await;
    let mut client = MarketClient::connect(&addr).await.unwrap();

    let holders = client.check_holders(&"cd".repeat(32)).await.unwrap();
    assert!(holders.is_empty());
}

#[tokio::test]
async fn invalid_key_error_carries_the_category() {
    let addr = spawn_server().await;
    let mut client = MarketClient::connect(&addr).await.unwrap();

    let err = client
        .register_file("short", User::new("alice", "203.0.113.4", 4001, 15))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(message) => assert!(message.starts_with("InvalidKey")),
        other => panic!("unexpected error: {other}"),
    }

    let err = client.check_holders("also-short").await.unwrap_err();
    match err {
        RpcError::Remote(message) => assert!(message.starts_with("InvalidKey")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn one_connection_carries_many_calls() {
    let addr = spawn_server().await;
    let mut client = MarketClient::connect(&addr).await.unwrap();

    let hash = "ef".repeat(32);
    client
        .register_file(&hash, User::new("alice", "203.0.113.4", 4001, 10))
        .await
        .unwrap();
    client
        .register_file(&hash, User::new("alice", "203.0.113.4", 4001, 30))
        .await
        .unwrap();

    let holders = client.check_holders(&hash).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].price, 30);
}
