//! End-to-end flows of the marketplace core: several publishers sharing
//! one record table, replica arbitration, and the byzantine rejection
//! paths. Nodes run against a shared in-process DHT so the whole exchange
//! happens in one process.

use std::sync::{Arc, LazyLock};

use orcanet_market::{
    decode_record, encode_record, namespaced, unix_now_secs, Keypair, Market, MarketError,
    MarketValidator, MemoryDht, RecordDht, User, ValidateError, TIMESTAMP_LEN,
};

// 1024-bit keys keep RSA generation out of the test runtime; generated
// once and shared by every test in this binary.
static KEYS: LazyLock<Vec<Arc<Keypair>>> = LazyLock::new(|| {
    (0..3)
        .map(|_| Arc::new(Keypair::generate_with_bits(1024).unwrap()))
        .collect()
});

fn file_hash() -> String {
    "aa".repeat(32)
}

fn user(name: &str, price: i64) -> User {
    User::new(name, "203.0.113.10", 4001, price)
}

#[tokio::test]
async fn empty_key_has_no_holders() {
    let dht = Arc::new(MemoryDht::new());
    let market = Market::new(KEYS[0].clone(), dht);

    let holders = market.check_holders(&file_hash()).await.unwrap();
    assert!(holders.is_empty());
}

#[tokio::test]
async fn single_publisher_round_trip() {
    let dht = Arc::new(MemoryDht::new());
    let market = Market::new(KEYS[0].clone(), dht);

    market
        .register_file(&file_hash(), user("alice", 10))
        .await
        .unwrap();

    let holders = market.check_holders(&file_hash()).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].name, "alice");
    assert_eq!(holders[0].id, KEYS[0].public_key_bytes());
}

#[tokio::test]
async fn two_sequential_publishers_extend_the_record() {
    let dht = Arc::new(MemoryDht::new());
    let alice = Market::new(KEYS[0].clone(), dht.clone());
    let bob = Market::new(KEYS[1].clone(), dht.clone());

    alice
        .register_file(&file_hash(), user("alice", 10))
        .await
        .unwrap();
    bob.register_file(&file_hash(), user("bob", 20))
        .await
        .unwrap();

    let holders = bob.check_holders(&file_hash()).await.unwrap();
    assert_eq!(
        holders.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
        vec!["alice", "bob"]
    );
    assert_eq!(holders[0].id, KEYS[0].public_key_bytes());
    assert_eq!(holders[1].id, KEYS[1].public_key_bytes());

    // The stored record is exactly the two entries plus the timestamp.
    let candidates = dht.search_record(namespaced(&file_hash())).await.unwrap();
    assert_eq!(candidates.len(), 1);
    let record = decode_record(&candidates[0]).unwrap();
    let entries_len: usize = record.entries.iter().map(|e| e.encoded_len()).sum();
    assert_eq!(candidates[0].len(), entries_len + TIMESTAMP_LEN);
}

#[tokio::test]
async fn re_register_replaces_own_entry() {
    let dht = Arc::new(MemoryDht::new());
    let market = Market::new(KEYS[0].clone(), dht);

    market
        .register_file(&file_hash(), user("alice", 10))
        .await
        .unwrap();
    market
        .register_file(&file_hash(), user("alice", 20))
        .await
        .unwrap();

    let holders = market.check_holders(&file_hash()).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].price, 20);
}

#[tokio::test]
async fn monotone_extension_across_three_publishers() {
    let dht = Arc::new(MemoryDht::new());
    let names = ["alice", "bob", "carol"];

    for (keypair, name) in KEYS.iter().zip(names) {
        let market = Market::new(keypair.clone(), dht.clone());
        market
            .register_file(&file_hash(), user(name, 5))
            .await
            .unwrap();
    }

    let reader = Market::new(KEYS[0].clone(), dht.clone());
    let holders = reader.check_holders(&file_hash()).await.unwrap();
    assert_eq!(
        holders.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
        names
    );
    for (holder, keypair) in holders.iter().zip(KEYS.iter()) {
        assert_eq!(holder.id, keypair.public_key_bytes());
    }
}

#[tokio::test]
async fn tampered_replica_is_rejected_and_never_selected() {
    let dht = Arc::new(MemoryDht::new());
    let alice = Market::new(KEYS[0].clone(), dht.clone());
    let bob = Market::new(KEYS[1].clone(), dht.clone());

    alice
        .register_file(&file_hash(), user("alice", 10))
        .await
        .unwrap();
    bob.register_file(&file_hash(), user("bob", 20))
        .await
        .unwrap();

    let key = namespaced(&file_hash());
    let valid = dht.search_record(key.clone()).await.unwrap().remove(0);

    // Invert the final signature byte (just before the timestamp).
    let mut tampered = valid.clone();
    let pos = tampered.len() - TIMESTAMP_LEN - 1;
    tampered[pos] ^= 0xFF;

    let validator = MarketValidator;
    assert!(matches!(
        validator.validate(&key, &tampered),
        Err(ValidateError::BadSignature)
    ));
    assert_eq!(validator.select(&key, &[valid, tampered]), 0);
}

#[tokio::test]
async fn future_stamped_record_is_rejected() {
    let dht = Arc::new(MemoryDht::new());
    let market = Market::new(KEYS[0].clone(), dht.clone());

    market
        .register_file(&file_hash(), user("alice", 10))
        .await
        .unwrap();

    let key = namespaced(&file_hash());
    let valid = dht.search_record(key.clone()).await.unwrap().remove(0);

    let record = decode_record(&valid).unwrap();
    let future = encode_record(&record.entries, unix_now_secs() + 3600).unwrap();

    assert!(matches!(
        MarketValidator.validate(&key, &future),
        Err(ValidateError::FutureTimestamp { .. })
    ));
}

#[tokio::test]
async fn invalid_key_is_refused_before_the_network() {
    let dht = Arc::new(MemoryDht::new());
    let market = Market::new(KEYS[0].clone(), dht.clone());

    let err = market
        .register_file("not-a-hash", user("alice", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidKey(_)));
    assert!(dht.is_empty());
}

#[tokio::test]
async fn distinct_keys_do_not_interfere() {
    let dht = Arc::new(MemoryDht::new());
    let market = Market::new(KEYS[0].clone(), dht.clone());

    let other_hash = "bb".repeat(32);
    market
        .register_file(&file_hash(), user("alice", 10))
        .await
        .unwrap();
    market
        .register_file(&other_hash, user("alice", 99))
        .await
        .unwrap();

    let first = market.check_holders(&file_hash()).await.unwrap();
    let second = market.check_holders(&other_hash).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].price, 10);
    assert_eq!(second[0].price, 99);
    assert_eq!(market.registered_files(), 2);
}
