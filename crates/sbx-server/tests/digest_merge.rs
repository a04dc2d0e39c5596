//! Server merge semantics driven over the raw wire: newer-wins, stale
//! mirror-back, and identity rebind enforcement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;

use sbx_core::protocol::{
    Action, DataType, DigestPayload, FilePayload, Identity, Request, Response, SyncPayload,
};
use sbx_core::store::BlobStore;
use sbx_core::transport::Hub;
use sbx_core::tree::{Checksum, Dir};
use sbx_server::db::Db;
use sbx_server::{Server, ServerConfig};
use sbx_test_utils::{write_tree, MemoryStore};

const USER: &str = "carol";

async fn start_server() -> (Db, Arc<MemoryStore>, Arc<Server>, SocketAddr) {
    let db = Db::connect_in_memory().await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let server = Server::new(
        db.clone(),
        Arc::clone(&store) as Arc<dyn BlobStore>,
        ServerConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            port: 0,
            allow_identity_rebind: false,
        },
    );
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serve.serve(listener).await;
    });
    (db, store, server, addr)
}

/// A hand-driven device: answers sync pulls from a path->bytes map and
/// records every digest the server mirrors at it.
struct ScriptedDevice {
    hub: Arc<Hub>,
    identity: Identity,
    mirrored: Arc<Mutex<Vec<Dir>>>,
}

impl ScriptedDevice {
    async fn connect(addr: SocketAddr, device: &str, files: HashMap<String, Vec<u8>>) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (hub, mut requests) = Hub::spawn(stream);
        let identity = Identity {
            username: USER.into(),
            password: "pw-hash".into(),
            device: device.into(),
        };
        let mirrored = Arc::new(Mutex::new(Vec::new()));

        let loop_hub = Arc::clone(&hub);
        let loop_identity = identity.clone();
        let loop_mirrored = Arc::clone(&mirrored);
        tokio::spawn(async move {
            while let Some(body) = requests.recv().await {
                let request: Request = serde_json::from_slice(&body).unwrap();
                match request.kind().unwrap() {
                    DataType::Digest => {
                        let payload: DigestPayload = request.decode().unwrap();
                        loop_mirrored.lock().unwrap().push(payload.dir);
                        loop_hub
                            .send_response(&Response::accept(&request))
                            .await
                            .unwrap();
                    }
                    DataType::SyncRequest => {
                        let payload: SyncPayload = request.decode().unwrap();
                        assert_eq!(payload.action, Action::Get);
                        let content = files
                            .get(&payload.unroot_path)
                            .unwrap_or_else(|| panic!("no scripted file {}", payload.unroot_path))
                            .clone();
                        loop_hub
                            .send_response(&Response::accept(&request))
                            .await
                            .unwrap();
                        let push = Request::new(
                            &loop_identity,
                            DataType::File,
                            serde_json::to_vec(&FilePayload {
                                file: payload.file.clone(),
                                unroot_path: payload.unroot_path.clone(),
                                content,
                            })
                            .unwrap(),
                        );
                        loop_hub.send_request_for_response(&push).await.unwrap();
                    }
                    _ => {
                        loop_hub
                            .send_response(&Response::accept(&request))
                            .await
                            .unwrap();
                    }
                }
            }
        });

        Self {
            hub,
            identity,
            mirrored,
        }
    }

    async fn send_digest(&self, dir: &Dir) -> Response {
        let request = Request::new(
            &self.identity,
            DataType::Digest,
            serde_json::to_vec(&DigestPayload { dir: dir.clone() }).unwrap(),
        );
        self.hub.send_request_for_response(&request).await.unwrap()
    }

    fn mirrored_checksums(&self) -> Vec<Checksum> {
        self.mirrored
            .lock()
            .unwrap()
            .iter()
            .map(|dir| dir.checksum())
            .collect()
    }
}

fn tree_with_mod_time(files: &[(&str, &str)], mod_time: i64) -> (tempfile::TempDir, Dir) {
    let scratch = tempfile::tempdir().unwrap();
    write_tree(scratch.path(), files);
    let mut dir = sbx_core::tree::build(scratch.path()).unwrap();
    dir.object.mod_time = mod_time;
    (scratch, dir)
}

async fn wait_for_object(store: &Arc<MemoryStore>, name: &str) {
    for _ in 0..100 {
        if store.contains(USER, name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("object {name} never appeared");
}

#[tokio::test]
async fn newer_client_tree_becomes_authoritative() {
    let (_db, store, _server, addr) = start_server().await;

    let files = HashMap::from([("/a.txt".to_string(), b"A".to_vec())]);
    let device = ScriptedDevice::connect(addr, "laptop", files).await;

    let (_scratch, dir) = tree_with_mod_time(&[("a.txt", "A")], 1_000_000);
    let response = device.send_digest(&dir).await;
    assert!(response.is_accept());

    wait_for_object(&store, &Checksum::of(b"A").to_num_string()).await;
    wait_for_object(&store, ".sb-digest.json").await;

    let persisted = Dir::from_json(&store.get_object(USER, ".sb-digest.json").await.unwrap())
        .unwrap();
    assert_eq!(persisted.checksum(), dir.checksum());
}

#[tokio::test]
async fn stale_client_tree_is_mirrored_back() {
    let (_db, store, _server, addr) = start_server().await;

    let files = HashMap::from([
        ("/a.txt".to_string(), b"A".to_vec()),
        ("/old.txt".to_string(), b"OLD".to_vec()),
    ]);
    let device = ScriptedDevice::connect(addr, "laptop", files).await;

    // establish an authoritative tree at t=1_000_000
    let (_scratch_a, newer) = tree_with_mod_time(&[("a.txt", "A")], 1_000_000);
    device.send_digest(&newer).await;
    wait_for_object(&store, ".sb-digest.json").await;

    // a stale tree from the past must not win; the server mirrors its own
    // view back instead of applying the diff
    let (_scratch_b, stale) = tree_with_mod_time(&[("old.txt", "OLD")], 500);
    let response = device.send_digest(&stale).await;
    assert!(response.is_accept());

    for _ in 0..100 {
        if !device.mirrored_checksums().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(device.mirrored_checksums(), vec![newer.checksum()]);

    // the stale device's content was never pulled and the digest still
    // holds the newer tree
    assert!(!store.contains(USER, &Checksum::of(b"OLD").to_num_string()));
    let persisted = Dir::from_json(&store.get_object(USER, ".sb-digest.json").await.unwrap())
        .unwrap();
    assert_eq!(persisted.checksum(), newer.checksum());
}

#[tokio::test]
async fn identity_change_mid_connection_closes_it() {
    let (_db, _store, server, addr) = start_server().await;

    let device = ScriptedDevice::connect(addr, "laptop", HashMap::new()).await;
    let (_scratch, dir) = tree_with_mod_time(&[("a.txt", "A")], 0);

    // bind as carol first (mod_time 0 keeps the server from pulling)
    let response = device.send_digest(&dir).await;
    assert!(response.is_accept());
    for _ in 0..100 {
        if server.client_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // now claim to be someone else on the same connection
    let imposter = Identity {
        username: "mallory".into(),
        password: "pw".into(),
        device: "laptop".into(),
    };
    let request = Request::new(
        &imposter,
        DataType::Digest,
        serde_json::to_vec(&DigestPayload { dir: dir.clone() }).unwrap(),
    );
    // the server tears the connection down instead of answering
    let result = device.hub.send_request_for_response(&request).await;
    assert!(result.is_err());

    for _ in 0..100 {
        if server.client_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection was not torn down after identity rebind");
}
