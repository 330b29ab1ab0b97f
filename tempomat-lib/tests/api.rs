//! Round-trips against a live introspection endpoint: the contract the
//! doctor tooling depends on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http::HeaderMap;
use tempomat_lib::api::{self, Client};
use tempomat_lib::bucket::BucketSet;
use tempomat_lib::config::Config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

fn test_config() -> Config {
    Config {
        cpu_count: 4.0,
        slash32_share: 0.1,
        slash24_share: 0.1,
        slash16_share: 0.1,
        user_agent_share: 0.1,
        ..Config::default()
    }
}

fn peer(addr: &str) -> SocketAddr {
    addr.parse().unwrap()
}

async fn start_endpoint(buckets: Arc<BucketSet>) -> (String, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(api::serve(listener, buckets, shutdown_rx));
    (addr, shutdown_tx)
}

#[tokio::test]
async fn dump_round_trip() {
    let buckets = Arc::new(BucketSet::new(&test_config()));
    buckets.charge(peer("1.1.1.1:9"), &HeaderMap::new(), Instant::now(), 0.1);
    let (addr, _shutdown) = start_endpoint(buckets).await;

    let mut client = Client::connect(&addr).await.unwrap();
    let entries = client.dump("Slash32").await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].title, "1.1.1.1/32");
    assert_eq!(entries[0].hash.len(), 32);
    assert!(entries[0].last_used > 0.0);
    assert_eq!(entries[0].avg_wait, 0.0);
}

#[tokio::test]
async fn repeated_dumps_share_one_connection() {
    let buckets = Arc::new(BucketSet::new(&test_config()));
    buckets.charge(peer("1.1.1.1:9"), &HeaderMap::new(), Instant::now(), 0.1);
    let (addr, _shutdown) = start_endpoint(buckets).await;

    let mut client = Client::connect(&addr).await.unwrap();
    let first = client.dump("Slash32").await.unwrap();
    let second = client.dump("Slash32").await.unwrap();

    // Same number of entries, same identities: nothing else touched
    // the bucket in between.
    assert_eq!(first.len(), second.len());
    let mut first_hashes: Vec<_> = first.iter().map(|e| e.hash.clone()).collect();
    let mut second_hashes: Vec<_> = second.iter().map(|e| e.hash.clone()).collect();
    first_hashes.sort();
    second_hashes.sort();
    assert_eq!(first_hashes, second_hashes);
}

#[tokio::test]
async fn unknown_bucket_is_an_empty_list_not_an_error() {
    let buckets = Arc::new(BucketSet::new(&test_config()));
    let (addr, _shutdown) = start_endpoint(buckets).await;

    let mut client = Client::connect(&addr).await.unwrap();
    assert!(client.dump("NoSuchBucket").await.unwrap().is_empty());
    // Lookup is case-sensitive.
    assert!(client.dump("slash32").await.unwrap().is_empty());
    // The connection is still usable afterwards.
    assert!(client.dump("Slash32").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_method_is_an_empty_list() {
    let buckets = Arc::new(BucketSet::new(&test_config()));
    buckets.charge(peer("1.1.1.1:9"), &HeaderMap::new(), Instant::now(), 0.1);
    let (addr, _shutdown) = start_endpoint(buckets).await;

    // Speak the framing by hand with a method the server never heard
    // of.
    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let payload = br#"{"Method":"TempomatAPI.Flush","BucketName":"Slash32"}"#;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
    stream.write_all(payload).await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let mut reply = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut reply).await.unwrap();

    let entries: Vec<serde_json::Value> = serde_json::from_slice(&reply).unwrap();
    assert!(entries.is_empty());
}
