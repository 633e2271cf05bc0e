//! End-to-end transfer sessions over TLS on loopback: ask/upload happy paths,
//! rejection, token capability checks and receiver-side cancellation.

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use tempfile::TempDir;

use mesh_drop::{
    config::ConfigStore,
    discovery,
    discovery::model::Peer,
    host::{EventBus, LogNotifier},
    transfer::{
        self,
        archive,
        model::{ContentType, Transfer, TransferAskResponse, TransferStatus, TransferType},
    },
};

struct Node {
    config: Arc<ConfigStore>,
    transfer: Arc<transfer::Service>,
    downloads: PathBuf,
    _tmp: TempDir,
}

fn make_node(auto_accept: bool) -> Node {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(ConfigStore::load_from(tmp.path()).unwrap());
    let downloads = tmp.path().join("downloads");
    config.set_save_path(&downloads);
    config.set_auto_accept(auto_accept);
    let events = EventBus::new();
    let discovery = discovery::Service::new(Arc::clone(&config), events.clone(), 0);
    let transfer = transfer::Service::new(
        Arc::clone(&config),
        discovery,
        events,
        Arc::new(LogNotifier),
        0,
    )
    .unwrap();
    Node {
        config,
        transfer,
        downloads,
        _tmp: tmp,
    }
}

async fn serve(node: &Node) -> u16 {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(Arc::clone(&node.transfer).serve_with_listener(listener));
    port
}

fn peer_for(node: &Node, port: u16) -> Peer {
    Peer {
        id: node.config.id(),
        name: node.config.host_name(),
        routes: Default::default(),
        port,
        os: Default::default(),
        public_key: node.config.public_key(),
        trust_mismatch: false,
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn insecure_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

#[tokio::test]
async fn file_transfer_completes_and_renames_on_collision() {
    let receiver = make_node(true);
    let port = serve(&receiver).await;
    let sender = make_node(false);

    let payload: Vec<u8> = (0..1_048_577u32).map(|i| (i % 251) as u8).collect();
    let source = sender._tmp.path().join("doc.pdf");
    fs::write(&source, &payload).unwrap();

    let target = peer_for(&receiver, port);
    sender
        .transfer
        .send_file(target.clone(), "127.0.0.1".to_string(), source.clone());
    wait_for("first transfer to complete", || {
        sender
            .transfer
            .get_transfer_list()
            .iter()
            .filter(|t| t.status == TransferStatus::Completed)
            .count()
            == 1
    })
    .await;

    let received = receiver.downloads.join("doc.pdf");
    wait_for("receiver to finish writing", || {
        receiver
            .transfer
            .get_transfer_list()
            .iter()
            .any(|t| t.status == TransferStatus::Completed)
    })
    .await;
    assert_eq!(fs::read(&received).unwrap(), payload);

    let inbound = receiver
        .transfer
        .get_transfer_list()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(inbound.transfer_type, TransferType::Receive);
    assert_eq!(inbound.file_size, payload.len() as i64);
    assert_eq!(inbound.progress.current, payload.len() as i64);
    assert_eq!(inbound.progress.total, payload.len() as i64);

    // same name again lands next to the original
    sender
        .transfer
        .send_file(target, "127.0.0.1".to_string(), source);
    wait_for("second transfer to complete", || {
        sender
            .transfer
            .get_transfer_list()
            .iter()
            .filter(|t| t.status == TransferStatus::Completed)
            .count()
            == 2
    })
    .await;
    assert_eq!(
        fs::read(receiver.downloads.join("doc (1).pdf")).unwrap(),
        payload
    );
}

#[tokio::test]
async fn trusted_sender_is_accepted_without_interaction() {
    let receiver = make_node(false);
    let port = serve(&receiver).await;
    let sender = make_node(false);
    receiver
        .config
        .add_trust(sender.config.id(), sender.config.public_key());

    let target = peer_for(&receiver, port);
    sender
        .transfer
        .send_text(target, "127.0.0.1".to_string(), "hello mesh".to_string());

    wait_for("text transfer to complete", || {
        receiver
            .transfer
            .get_transfer_list()
            .iter()
            .any(|t| t.status == TransferStatus::Completed)
    })
    .await;
    let inbound = receiver
        .transfer
        .get_transfer_list()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(inbound.content_type, ContentType::Text);
    assert_eq!(inbound.text, "hello mesh");
    assert_eq!(inbound.file_size, "hello mesh".len() as i64);
}

#[tokio::test]
async fn unknown_sender_is_held_pending_and_can_be_rejected() {
    let receiver = make_node(false);
    let port = serve(&receiver).await;
    let sender = make_node(false);

    let source = sender._tmp.path().join("notes.txt");
    fs::write(&source, b"private").unwrap();
    let target = peer_for(&receiver, port);
    sender
        .transfer
        .send_file(target, "127.0.0.1".to_string(), source);

    wait_for("ask to arrive", || {
        receiver
            .transfer
            .get_transfer_list()
            .iter()
            .any(|t| t.status == TransferStatus::Pending)
    })
    .await;
    let pending = receiver
        .transfer
        .get_transfer_list()
        .into_iter()
        .find(|t| t.status == TransferStatus::Pending)
        .unwrap();

    assert!(receiver
        .transfer
        .resolve_pending_request(&pending.id, false, None));

    wait_for("sender to observe rejection", || {
        sender
            .transfer
            .get_transfer_list()
            .iter()
            .any(|t| t.status == TransferStatus::Rejected)
    })
    .await;
    assert_eq!(
        receiver.transfer.get_transfer(&pending.id).unwrap().status,
        TransferStatus::Rejected
    );
    assert!(fs::read_dir(&receiver.downloads).unwrap().next().is_none());
}

#[tokio::test]
async fn uploads_require_the_issued_token() {
    let receiver = make_node(true);
    let port = serve(&receiver).await;
    let client = insecure_client();

    let mut sender_peer = Peer::default();
    sender_peer.id = "stranger".to_string();
    sender_peer.name = "stranger-box".to_string();
    let ask = Transfer::new("ask-1", sender_peer)
        .with_file_name("secret.bin")
        .with_file_size(4)
        .with_type(TransferType::Send)
        .with_content_type(ContentType::File);

    let response = client
        .post(format!("https://127.0.0.1:{port}/transfer/ask"))
        .json(&ask)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let decision: TransferAskResponse = response.json().await.unwrap();
    assert!(decision.accepted);
    let token = decision.token.unwrap();

    // absent token
    let response = client
        .put(format!("https://127.0.0.1:{port}/transfer/upload/ask-1"))
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // wrong token
    let response = client
        .put(format!(
            "https://127.0.0.1:{port}/transfer/upload/ask-1?token=wrong"
        ))
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // unknown transfer id
    let response = client
        .put(format!(
            "https://127.0.0.1:{port}/transfer/upload/nope?token={token}"
        ))
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    assert!(fs::read_dir(&receiver.downloads).unwrap().next().is_none());

    // the real token still works after the failed attempts
    let response = client
        .put(format!(
            "https://127.0.0.1:{port}/transfer/upload/ask-1?token={token}"
        ))
        .header(reqwest::header::CONTENT_LENGTH, 4)
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        fs::read(receiver.downloads.join("secret.bin")).unwrap(),
        b"data"
    );
}

#[tokio::test]
async fn folder_transfer_reproduces_the_tree_and_presized_length() {
    let receiver = make_node(true);
    let port = serve(&receiver).await;
    let sender = make_node(false);

    let src = sender._tmp.path().join("proj");
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("a.txt"), vec![b'a'; 100]).unwrap();
    fs::write(src.join("sub/b.bin"), vec![b'b'; 513]).unwrap();
    let expected_size = archive::calculate_tar_size(&src).unwrap();

    let target = peer_for(&receiver, port);
    sender
        .transfer
        .send_folder(target, "127.0.0.1".to_string(), src);

    wait_for("folder transfer to complete", || {
        receiver
            .transfer
            .get_transfer_list()
            .iter()
            .any(|t| t.status == TransferStatus::Completed)
    })
    .await;

    let inbound = receiver
        .transfer
        .get_transfer_list()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(inbound.content_type, ContentType::Folder);
    assert_eq!(inbound.file_size, expected_size);
    assert_eq!(inbound.progress.current, expected_size);

    let dest = receiver.downloads.join("proj");
    assert_eq!(fs::read(dest.join("a.txt")).unwrap(), vec![b'a'; 100]);
    assert_eq!(fs::read(dest.join("sub/b.bin")).unwrap(), vec![b'b'; 513]);
}

#[tokio::test]
async fn receiver_cancel_mid_upload_answers_canceled_and_cleans_up() {
    let receiver = make_node(true);
    let port = serve(&receiver).await;
    let client = insecure_client();

    let mut sender_peer = Peer::default();
    sender_peer.id = "stranger".to_string();
    sender_peer.name = "stranger-box".to_string();
    let ask = Transfer::new("slow-1", sender_peer)
        .with_file_name("big.bin")
        .with_file_size(1_000_000)
        .with_type(TransferType::Send)
        .with_content_type(ContentType::File);
    let decision: TransferAskResponse = client
        .post(format!("https://127.0.0.1:{port}/transfer/ask"))
        .json(&ask)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = decision.token.unwrap();

    // stream a little data, then stall so the upload stays in flight
    let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Vec<u8>, std::io::Error>>();
    tx.unbounded_send(Ok(vec![0u8; 10_000])).unwrap();
    let upload = tokio::spawn(
        client
            .put(format!(
                "https://127.0.0.1:{port}/transfer/upload/slow-1?token={token}"
            ))
            .header(reqwest::header::CONTENT_LENGTH, 1_000_000)
            .body(reqwest::Body::wrap_stream(rx))
            .send(),
    );

    wait_for("upload to become active", || {
        receiver
            .transfer
            .get_transfer("slow-1")
            .map(|t| t.status == TransferStatus::Active && t.progress.current > 0)
            .unwrap_or(false)
    })
    .await;

    receiver.transfer.cancel_transfer("slow-1");

    let response = upload.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    let body: transfer::model::TransferUploadResponse = response.json().await.unwrap();
    assert_eq!(body.status, TransferStatus::Canceled);

    assert_eq!(
        receiver.transfer.get_transfer("slow-1").unwrap().status,
        TransferStatus::Canceled
    );
    // partial file is removed
    assert!(fs::read_dir(&receiver.downloads).unwrap().next().is_none());
    drop(tx);
}
