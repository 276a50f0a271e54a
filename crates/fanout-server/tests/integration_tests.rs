//! End-to-end signaling tests over a real WebSocket connection.
//!
//! Run with: cargo test -p fanout-server --test integration_tests

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use fanout_protocol::SignalMessage;
use fanout_server::state::Config;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test server wrapper
struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            stun_servers: vec![],
            udp_port_min: 0,
            udp_port_max: 0,
        };

        let (router, _state) = fanout_server::create_app(config)?;

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    async fn connect(&self) -> WsClient {
        let (client, _) = connect_async(self.ws_url())
            .await
            .expect("failed to connect to test server");
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn send(client: &mut WsClient, message: &SignalMessage) {
    let json = serde_json::to_string(message).unwrap();
    client
        .send(Message::Text(json.into()))
        .await
        .expect("failed to send message");
}

/// Read frames until one parses as the wanted signaling event.
async fn expect_event(client: &mut WsClient, want: fn(&SignalMessage) -> bool) -> SignalMessage {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = client
                .next()
                .await
                .expect("connection closed while waiting for event")
                .expect("websocket error while waiting for event");
            let Message::Text(text) = frame else { continue };
            let message: SignalMessage = serde_json::from_str(text.as_str()).unwrap();
            if want(&message) {
                return message;
            }
        }
    })
    .await
    .expect("timed out waiting for signaling event")
}

/// Drain frames for a moment and assert none of them matches.
async fn expect_no_event(client: &mut WsClient, reject: fn(&SignalMessage) -> bool) {
    let window = tokio::time::sleep(Duration::from_millis(800));
    tokio::pin!(window);

    loop {
        tokio::select! {
            _ = &mut window => return,
            frame = client.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message: SignalMessage = serde_json::from_str(text.as_str()).unwrap();
                    assert!(!reject(&message), "received an event that must not arrive");
                }
                Some(_) => {}
                // Stream ended: nothing further can arrive.
                None => return,
            }
        }
    }
}

#[tokio::test]
async fn every_joiner_is_offered_a_session() {
    let server = TestServer::start().await.unwrap();

    let mut client_a = server.connect().await;
    expect_event(&mut client_a, |m| matches!(m, SignalMessage::Offer(_))).await;

    // A second join renegotiates the newcomer and the existing session.
    let mut client_b = server.connect().await;
    expect_event(&mut client_b, |m| matches!(m, SignalMessage::Offer(_))).await;
    expect_event(&mut client_a, |m| matches!(m, SignalMessage::Offer(_))).await;
}

#[tokio::test]
async fn chat_is_broadcast_to_every_other_session() {
    let server = TestServer::start().await.unwrap();

    let mut client_a = server.connect().await;
    let mut client_b = server.connect().await;
    expect_event(&mut client_a, |m| matches!(m, SignalMessage::Offer(_))).await;
    expect_event(&mut client_b, |m| matches!(m, SignalMessage::Offer(_))).await;

    send(&mut client_a, &SignalMessage::Chat("hello".to_string())).await;

    let message = expect_event(&mut client_b, |m| matches!(m, SignalMessage::Chat(_))).await;
    assert_eq!(message, SignalMessage::Chat("hello".to_string()));

    // The sender itself never hears the chat back.
    expect_no_event(&mut client_a, |m| matches!(m, SignalMessage::Chat(_))).await;
}

#[tokio::test]
async fn unknown_events_are_ignored() {
    let server = TestServer::start().await.unwrap();

    let mut client_a = server.connect().await;
    let mut client_b = server.connect().await;
    expect_event(&mut client_a, |m| matches!(m, SignalMessage::Offer(_))).await;
    expect_event(&mut client_b, |m| matches!(m, SignalMessage::Offer(_))).await;

    client_a
        .send(Message::Text(
            r#"{"event":"wiggle","data":"whatever"}"#.into(),
        ))
        .await
        .unwrap();

    // The session survived the unknown event and still relays chat.
    send(&mut client_a, &SignalMessage::Chat("still here".to_string())).await;
    let message = expect_event(&mut client_b, |m| matches!(m, SignalMessage::Chat(_))).await;
    assert_eq!(message, SignalMessage::Chat("still here".to_string()));
}

#[tokio::test]
async fn malformed_messages_terminate_only_the_offender() {
    let server = TestServer::start().await.unwrap();

    let mut client_a = server.connect().await;
    expect_event(&mut client_a, |m| matches!(m, SignalMessage::Offer(_))).await;

    client_a
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();

    // The server drops the offending session; the client observes the
    // connection closing.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client_a.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed after bad input");

    // Other sessions are unaffected: a fresh join still works.
    let mut client_b = server.connect().await;
    expect_event(&mut client_b, |m| matches!(m, SignalMessage::Offer(_))).await;
}
