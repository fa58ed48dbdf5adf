//! Integration tests for the MeshNode public API.
//!
//! Every test binds real QUIC endpoints on loopback and drives nodes through the
//! same calls a host application would make.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hashmesh::{
    ChunkSource, LocalFile, LocalSearch, MSG_TYPE_HEALTH, MediaKind, MeshConfig, MeshError, MeshNode, NatClass,
    PeerAddr, SecurityViolation, byte_hash_of,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_millis(500);

const PROOF_PREFIX: usize = 32 * 1024;

/// In-memory stand-in for a host's media library.
#[derive(Default)]
struct Library {
    files: Vec<LocalFile>,
    content: HashMap<String, Vec<u8>>,
}

impl Library {
    fn with_file(mut self, path: &str, size: u64) -> Self {
        self.files.push(LocalFile {
            path: path.to_string(),
            size,
        });
        self
    }

    fn with_content(mut self, key: &str, bytes: Vec<u8>) -> Self {
        self.content.insert(key.to_string(), bytes);
        self
    }
}

#[async_trait]
impl LocalSearch for Library {
    async fn search_local(&self, query: &str, results: mpsc::Sender<LocalFile>) -> Result<()> {
        for file in self.files.iter().filter(|f| f.path.contains(query)) {
            if results.send(file.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkSource for Library {
    async fn read_chunk(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.content.get(key).map(|bytes| {
            let start = (offset as usize).min(bytes.len());
            let end = (offset.saturating_add(length) as usize).min(bytes.len());
            bytes[start..end].to_vec()
        }))
    }
}

fn test_config(realm: &str) -> MeshConfig {
    MeshConfig {
        realm: realm.to_string(),
        bind: "127.0.0.1:0".parse().unwrap(),
        request_timeout_secs: 5,
        ..MeshConfig::default()
    }
}

async fn start(config: MeshConfig, library: Library) -> MeshNode {
    let library = Arc::new(library);
    MeshNode::start(config, library.clone(), library)
        .await
        .expect("node start failed")
}

/// Address-only dial target, as a user would type it.
fn dial(node: &MeshNode) -> PeerAddr {
    PeerAddr::new(node.local_addr().unwrap().to_string(), None)
}

fn media(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn node_start_and_identity() {
    let node = start(test_config("home"), Library::default()).await;

    let peer_id = node.peer_id().to_hex();
    assert_eq!(peer_id.len(), 64);
    assert!(node.local_addr().unwrap().port() > 0);

    let descriptor = node.descriptor().expect("descriptor signed at start");
    assert_eq!(descriptor.peer_id, node.peer_id());
    assert!(descriptor.verify().is_ok());
    assert_eq!(node.peer_addr().peer_id, Some(node.peer_id()));

    let diagnostics = node.diagnostics().await;
    assert_eq!(diagnostics.dht_nodes, 0);
    assert_eq!(diagnostics.hash_entries, 0);
    assert_eq!(diagnostics.nat_class, NatClass::Unknown);

    node.shutdown().await;
}

#[tokio::test]
async fn non_exportable_key_without_key_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = MeshConfig {
        data_dir: Some(dir.path().to_path_buf()),
        key_exportable: false,
        ..test_config("home")
    };
    let library = Arc::new(Library::default());
    let result = MeshNode::start(config, library.clone(), library).await;
    assert!(matches!(result, Err(MeshError::Fatal(_))));
}

#[tokio::test]
async fn identity_survives_restart_with_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = MeshConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..test_config("home")
    };

    let first = start(config.clone(), Library::default()).await;
    let peer_id = first.peer_id();
    first.shutdown().await;

    let second = start(config, Library::default()).await;
    assert_eq!(second.peer_id(), peer_id);
    second.shutdown().await;
}

#[tokio::test]
async fn first_connection_pins_certificate() {
    let a = start(test_config("home"), Library::default()).await;
    let b = start(test_config("home"), Library::default()).await;

    let target = dial(&b);
    let peer = timeout(TEST_TIMEOUT, a.connect_peer(&target))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(peer, b.peer_id());

    let pin = a
        .pins()
        .get_pin(&target.identifier())
        .unwrap()
        .expect("pinned on first contact");
    assert_eq!(pin.fingerprint.len(), 64);

    // The responder's descriptor came back in the handshake.
    assert_eq!(a.dht().node_count().await, 1);
    assert!(a.diagnostics().await.active_connections >= 1);

    // A second dial validates against the pin instead of re-pinning.
    assert_eq!(a.connect_peer(&target).await.unwrap(), b.peer_id());
    assert_eq!(a.pins().get_pin(&target.identifier()).unwrap(), Some(pin));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn pin_mismatch_is_rejected_before_handshake() {
    let a = start(test_config("home"), Library::default()).await;
    let b = start(test_config("home"), Library::default()).await;

    let target = dial(&b);
    a.pins()
        .set_pin(&target.identifier(), &"00".repeat(32))
        .unwrap();

    let err = a.connect_peer(&target).await.expect_err("pinned to another certificate");
    assert!(matches!(
        err,
        MeshError::Security(SecurityViolation::PinMismatch { .. })
    ));
    // The pin is never silently replaced.
    assert_eq!(
        a.pins().get_pin(&target.identifier()).unwrap().unwrap().fingerprint,
        "00".repeat(32)
    );
    assert_eq!(a.dht().node_count().await, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn blocklisted_peer_cannot_use_services() {
    let a = start(test_config("home"), Library::default().with_file("song.mp3", 10)).await;
    let b = start(test_config("home"), Library::default().with_file("song.mp3", 10)).await;

    b.admission()
        .blocklist()
        .block(hashmesh::BlockKey::Peer(a.peer_id()), "test", None);

    let result = timeout(TEST_TIMEOUT, a.search_peer(&dial(&b), "song", 10))
        .await
        .expect("search timed out");
    assert!(result.is_err());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn sync_verifies_possession_before_merging() {
    let content = media(7, 100 * 1024);
    let b = start(
        test_config("home"),
        Library::default().with_content("song:1", content.clone()),
    )
    .await;
    let a = start(test_config("home"), Library::default()).await;

    let byte_hash = byte_hash_of(&content[..PROOF_PREFIX]);
    b.publish_hash("song:1", &byte_hash, content.len() as u64, 0).unwrap();

    let target = dial(&b);
    a.connect_peer(&target).await.unwrap();
    let report = timeout(TEST_TIMEOUT, a.sync_with(&target))
        .await
        .expect("sync timed out")
        .expect("sync failed");

    assert_eq!(report.merged, 1);
    assert_eq!(report.rejected, 0);
    let entry = a.lookup_key("song:1").expect("entry replicated");
    assert_eq!(entry.byte_hash, byte_hash);
    assert_eq!(entry.origin_peer, b.peer_id());

    let stats = a.sync_stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.merged, 1);
    assert_eq!(a.diagnostics().await.sync_peers, 1);

    // Nothing new on the second round.
    let again = a.sync_with(&target).await.unwrap();
    assert_eq!(again.merged, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn sync_rejects_claims_without_content() {
    // The peer advertises a hash for bytes it does not actually serve.
    let claimed = media(1, 4096);
    let served = media(2, 4096);
    let liar = start(
        test_config("home"),
        Library::default().with_content("song:2", served),
    )
    .await;
    let a = start(test_config("home"), Library::default()).await;

    liar.publish_hash("song:2", &byte_hash_of(&claimed), claimed.len() as u64, 0)
        .unwrap();
    // And one it cannot produce at all.
    liar.publish_hash("song:3", &byte_hash_of(&claimed), claimed.len() as u64, 0)
        .unwrap();

    let target = dial(&liar);
    let report = timeout(TEST_TIMEOUT, a.sync_with(&target))
        .await
        .expect("sync timed out")
        .expect("sync failed");

    assert_eq!(report.merged, 0);
    assert_eq!(report.rejected, 2);
    assert!(a.lookup_key("song:2").is_none());
    assert!(a.lookup_key("song:3").is_none());
    assert_eq!(a.sync_stats().rejected_proofs, 2);

    a.shutdown().await;
    liar.shutdown().await;
}

#[tokio::test]
async fn mesh_search_returns_tagged_matches() {
    let library = Library::default()
        .with_file("music/song-one.flac", 30_000_000)
        .with_file("video/song-live.mkv", 900_000_000)
        .with_file("notes.txt", 10);
    let b = start(test_config("home"), library).await;
    let a = start(test_config("home"), Library::default()).await;

    let response = timeout(TEST_TIMEOUT, a.search_peer(&dial(&b), "song", 10))
        .await
        .expect("search timed out")
        .expect("search failed");

    assert_eq!(response.error, None);
    assert_eq!(response.files.len(), 2);
    assert_eq!(response.files[0].media_kind, MediaKind::Audio);
    assert_eq!(response.files[1].media_kind, MediaKind::Video);

    let too_long = a.search_peer(&dial(&b), &"x".repeat(300), 10).await.unwrap();
    assert!(too_long.files.is_empty());
    assert!(too_long.error.is_some());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn search_rate_limit_applies_per_peer() {
    let mut config = test_config("home");
    config.rate_limits.mesh_search_per_minute = 1;
    let b = start(config, Library::default().with_file("song.ogg", 1)).await;
    let a = start(test_config("home"), Library::default()).await;
    let target = dial(&b);

    let first = a.search_peer(&target, "song", 10).await.unwrap();
    assert_eq!(first.error, None);
    assert_eq!(first.files.len(), 1);

    let second = a.search_peer(&target, "song", 10).await.unwrap();
    assert!(second.files.is_empty());
    assert!(second.error.is_some());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn gossip_reaches_peers_in_same_realm_only() {
    let a = start(test_config("home"), Library::default()).await;
    let b = start(test_config("home"), Library::default()).await;

    let (tx, mut rx) = mpsc::channel(8);
    b.subscribe(MSG_TYPE_HEALTH, tx).await.unwrap();
    a.connect_peer(&dial(&b)).await.unwrap();

    let sent = a.publish_gossip(MSG_TYPE_HEALTH, b"ok".to_vec()).await.unwrap();
    assert_eq!(sent, 1);

    let received = timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("gossip not delivered")
        .expect("channel closed");
    assert_eq!(received.payload, b"ok".to_vec());
    assert_eq!(received.realm_id.as_deref(), Some("home"));
    assert_eq!(received.originator, a.peer_id());

    a.publish_gossip_for_realm(MSG_TYPE_HEALTH, "elsewhere", b"nope".to_vec())
        .await
        .unwrap();
    assert!(timeout(SHORT_TIMEOUT, rx.recv()).await.is_err());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn peers_discover_each_other_through_bootstrap() {
    let seed = start(test_config("home"), Library::default()).await;
    let b = start(test_config("home"), Library::default()).await;
    let c = start(test_config("home"), Library::default()).await;

    let reached = timeout(TEST_TIMEOUT, c.bootstrap(&[dial(&seed)]))
        .await
        .expect("bootstrap timed out")
        .unwrap();
    assert_eq!(reached, 1);
    assert!(seed.dht().node_count().await >= 1);

    timeout(TEST_TIMEOUT, b.bootstrap(&[dial(&seed)]))
        .await
        .expect("bootstrap timed out")
        .unwrap();

    let found = timeout(TEST_TIMEOUT, b.lookup(&c.peer_id()))
        .await
        .expect("lookup timed out")
        .unwrap()
        .expect("c should be discoverable");
    assert_eq!(found.peer_id, c.peer_id());
    assert_eq!(found.endpoints.overlay_addr, c.local_addr().unwrap().to_string());
    assert!(found.verify().is_ok());

    seed.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}
