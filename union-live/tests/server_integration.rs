//! End-to-end tests: a real server and real WebSocket clients.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use union_live::storage::chat;
use union_live::{
    ChatMessage, LiveServer, Message, MessageKind, ServerConfig, Store, StoreConfig, WsData,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port, the server and its store.
async fn start_test_server(dir: &tempfile::TempDir) -> (u16, Arc<LiveServer>, Arc<Store>) {
    let port = free_port().await;
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = Arc::new(LiveServer::new(config, store.clone()));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server, store)
}

/// Next text frame, decoded.
async fn next_frame(client: &mut Client) -> WsData {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("no websocket error");
        if let WsMessage::Text(text) = msg {
            return WsData::decode(text.as_str()).unwrap();
        }
    }
}

/// Connect and consume the history frame.
async fn connect(port: u16) -> (Client, Vec<ChatMessage>) {
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let history = next_frame(&mut client).await;
    assert_eq!(history.data.len(), 1);
    assert_eq!(history.data[0].kind(), Ok(MessageKind::ChatHistory));
    let messages: Vec<ChatMessage> = history.data[0].decode_data().unwrap();
    (client, messages)
}

fn chat_frame(text: &str) -> WsMessage {
    let data = WsData::single(Message::new(MessageKind::AddChat, &ChatMessage::new(text)).unwrap());
    WsMessage::text(data.encode().unwrap())
}

/// Poll until the engine reports `n` subscribers.
async fn wait_for_subscribers(server: &LiveServer, n: usize) {
    timeout(Duration::from_secs(2), async {
        while server.engine().subscribers().await.unwrap().len() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count within timeout");
}

#[tokio::test]
async fn test_new_client_gets_empty_history() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server, _store) = start_test_server(&dir).await;

    let (_client, history) = connect(port).await;
    assert!(history.is_empty());
    wait_for_subscribers(&server, 1).await;
}

#[tokio::test]
async fn test_chat_reaches_every_client() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server, store) = start_test_server(&dir).await;

    let (mut alice, _) = connect(port).await;
    let (mut bob, _) = connect(port).await;
    wait_for_subscribers(&server, 2).await;

    alice.send(chat_frame("selling 10 at 1.5")).await.unwrap();

    for client in [&mut alice, &mut bob] {
        let frame = next_frame(client).await;
        assert_eq!(frame.data[0].kind(), Ok(MessageKind::AddChat));
        let chat: ChatMessage = frame.data[0].decode_data().unwrap();
        assert_eq!(chat.text, "selling 10 at 1.5");
        assert!(chat.author_id.is_some());
        assert!(chat.time.is_some());
    }

    assert_eq!(chat::recent_messages(&store, 1).unwrap().len(), 1);
}

#[tokio::test]
async fn test_late_client_sees_history() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server, _store) = start_test_server(&dir).await;

    let (mut first, _) = connect(port).await;
    wait_for_subscribers(&server, 1).await;
    first.send(chat_frame("hello")).await.unwrap();
    next_frame(&mut first).await;

    let (_late, history) = connect(port).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "hello");
}

#[tokio::test]
async fn test_disconnect_leaves_engine() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server, _store) = start_test_server(&dir).await;

    let (mut client, _) = connect(port).await;
    wait_for_subscribers(&server, 1).await;

    client.close(None).await.unwrap();
    wait_for_subscribers(&server, 0).await;
}

#[tokio::test]
async fn test_bad_frames_keep_connection_open() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server, _store) = start_test_server(&dir).await;

    let (mut client, _) = connect(port).await;
    wait_for_subscribers(&server, 1).await;

    client.send(WsMessage::text("not json")).await.unwrap();
    client
        .send(WsMessage::text(r#"{"data":[{"type":42,"data":null}]}"#))
        .await
        .unwrap();
    client.send(chat_frame("still here")).await.unwrap();

    let frame = next_frame(&mut client).await;
    let chat: ChatMessage = frame.data[0].decode_data().unwrap();
    assert_eq!(chat.text, "still here");
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server, _store) = start_test_server(&dir).await;

    let (mut client, _) = connect(port).await;
    client.send(WsMessage::Ping(vec![7u8, 7].into())).await.unwrap();

    let msg = timeout(Duration::from_secs(2), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match msg {
        WsMessage::Pong(data) => assert_eq!(data.as_ref(), &[7u8, 7]),
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server, store) = start_test_server(&dir).await;

    let (mut client, _) = connect(port).await;
    wait_for_subscribers(&server, 1).await;

    server.shutdown().await;

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client should see the connection close");
    store.close().await;
}
