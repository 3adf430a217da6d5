//! Text, file list and server info exchanges between two engines

mod common;

use barn_owl_peer::{EventKind, MessageAuthor};
use common::TestPeer;
use tokio::fs;

#[tokio::test]
async fn test_text_message_opens_one_session_per_peer() {
    let alice = TestPeer::start().await;
    let bob = TestPeer::start().await;

    alice
        .server
        .send_text_message(bob.addr, "hello bob")
        .await
        .unwrap();
    alice
        .server
        .send_text_message(bob.addr, "are you there?")
        .await
        .unwrap();

    common::eventually(|| {
        let bob = bob.server.clone();
        async move { bob.unread_message_count() == 2 }
    })
    .await;

    let sessions = bob.server.text_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].remote, alice.addr);
    let messages: Vec<_> = sessions[0].messages.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(messages, ["hello bob", "are you there?"]);
    assert!(sessions[0]
        .messages
        .iter()
        .all(|m| m.author == MessageAuthor::Remote));

    // The sender keeps its own copy, already read
    let mine = alice.server.text_sessions();
    assert_eq!(mine[0].remote, bob.addr);
    assert_eq!(mine[0].messages.len(), 2);
    assert_eq!(alice.server.unread_message_count(), 0);

    let received = bob
        .wait_for_event(|k| matches!(k, EventKind::ReceivedTextMessage { .. }))
        .await;
    let EventKind::ReceivedTextMessage { text_session_id, .. } = received.kind else {
        unreachable!("matched above");
    };
    assert_eq!(text_session_id, sessions[0].id);

    bob.server.mark_text_session_read(text_session_id).unwrap();
    assert_eq!(bob.server.unread_message_count(), 0);
    assert!(bob.server.mark_text_session_read(text_session_id + 10).is_err());

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_text_to_unreachable_peer_fails() {
    let alice = TestPeer::start().await;
    let gone = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let err = alice
        .server
        .send_text_message(gone, "anyone?")
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
    assert!(alice.server.text_sessions().is_empty());

    alice.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_info_exchange() {
    let alice = TestPeer::start().await;
    let bob = TestPeer::start_with(|config| config.name = "bob".into()).await;

    alice.server.request_server_info(bob.addr).await.unwrap();
    alice
        .wait_for_event(|k| matches!(k, EventKind::ReceivedServerInfo { .. }))
        .await;

    let info = alice.server.remote_server_info(bob.addr);
    assert_eq!(info.name, "bob");
    assert_eq!(info.port, bob.addr.port());
    assert_eq!(info.session_address(), bob.addr);
    assert_eq!(info.transfer_folder, bob.inbox().to_string_lossy());
    assert_eq!(alice.server.known_remote_servers().len(), 1);

    bob.wait_for_event(|k| matches!(k, EventKind::ReceivedServerInfoRequest))
        .await;

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_file_list_of_transfer_folder() {
    let alice = TestPeer::start().await;
    let bob = TestPeer::start().await;

    fs::write(bob.inbox().join("b.txt"), b"bee").await.unwrap();
    fs::write(bob.inbox().join("a.txt"), b"a").await.unwrap();
    fs::create_dir(bob.inbox().join("nested")).await.unwrap();

    alice.server.request_file_list(bob.addr, "").await.unwrap();
    alice
        .wait_for_event(|k| matches!(k, EventKind::ReceivedFileList { .. }))
        .await;

    let list = alice.server.remote_file_list(bob.addr).unwrap();
    assert_eq!(list.folder, bob.inbox().to_string_lossy());
    let names: Vec<_> = list
        .files
        .files()
        .iter()
        .map(|f| (f.file_name().to_string(), f.size))
        .collect();
    assert_eq!(names, [("a.txt".to_string(), 1), ("b.txt".to_string(), 3)]);

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_file_list_of_empty_folder() {
    let alice = TestPeer::start().await;
    let bob = TestPeer::start().await;

    alice.server.request_file_list(bob.addr, "").await.unwrap();
    alice
        .wait_for_event(|k| matches!(k, EventKind::ReceivedNotificationNoFilesToDownload))
        .await;
    assert!(alice.server.remote_file_list(bob.addr).is_none());

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_file_list_of_missing_folder() {
    let alice = TestPeer::start().await;
    let bob = TestPeer::start().await;

    let missing = bob.dir.path().join("does-not-exist");
    alice
        .server
        .request_file_list(bob.addr, missing.to_str().unwrap())
        .await
        .unwrap();
    alice
        .wait_for_event(|k| matches!(k, EventKind::ReceivedNotificationFolderDoesNotExist))
        .await;

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}
