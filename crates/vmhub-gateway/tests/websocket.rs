//! End-to-end over a real WebSocket

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use vmhub_core::{StateViewModel, ViewModel, ViewModelTypes};
use vmhub_gateway::{AnonymousResolver, GatewayOptions, WsConfig, WsServer};
use vmhub_pipeline::Pipeline;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(max_connections: usize) -> (WsServer, String) {
    let types = ViewModelTypes::new();
    types.register_fn("Counter", |_| {
        Ok(Box::new(StateViewModel::new(json!({"count": 0}))) as Box<dyn ViewModel>)
    });

    let config = WsConfig {
        bind: "127.0.0.1:0".to_string(),
        max_connections,
        heartbeat_interval_secs: 30,
    };
    let server = WsServer::build(
        config,
        types,
        Pipeline::default(),
        GatewayOptions::default(),
        Arc::new(AnonymousResolver),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

async fn send(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn data(event: &Value) -> Value {
    serde_json::from_str(event["data"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_counter_over_websocket() {
    let (server, url) = start(10).await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    send(&mut client, json!({"type": "request_vm", "vm_id": "Counter"})).await;
    let event = recv(&mut client).await;
    assert_eq!(event["type"], "response_vm");
    assert_eq!(event["vm_id"], "Counter");
    assert_eq!(data(&event), json!({"count": 0}));

    send(
        &mut client,
        json!({"type": "update_vm", "vm_id": "Counter", "changes": {"count": 5}}),
    )
    .await;
    let event = recv(&mut client).await;
    assert_eq!(data(&event), json!({"count": 5}));

    send(&mut client, json!({"type": "dispose_vm", "vm_id": "Counter"})).await;
    send(
        &mut client,
        json!({"type": "update_vm", "vm_id": "Counter", "changes": {"count": 6}}),
    )
    .await;
    let event = recv(&mut client).await;
    assert_eq!(event["type"], "response_vm");
    assert_eq!(data(&event)["ExceptionType"], "VMNotFoundError");

    send(&mut client, json!({"type": "ping", "timestamp": 7})).await;
    let event = recv(&mut client).await;
    assert_eq!(event, json!({"type": "pong", "timestamp": 7}));

    client.send(Message::Text("not json".to_string())).await.unwrap();
    let event = recv(&mut client).await;
    assert_eq!(event["type"], "error");
    assert_eq!(event["code"], "INVALID_MESSAGE");

    assert_eq!(server.pool().count(), 1);
    assert_eq!(server.gateway().factory().len(), 1);

    client.close(None).await.unwrap();
    for _ in 0..50 {
        if server.gateway().factory().is_empty() && server.pool().count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.gateway().factory().is_empty());
    assert_eq!(server.pool().count(), 0);
}

#[tokio::test]
async fn test_capacity_exceeded() {
    let (_server, url) = start(1).await;
    let (mut first, _) = connect_async(url.as_str()).await.unwrap();

    // make sure the first connection is registered before the second arrives
    send(&mut first, json!({"type": "ping", "timestamp": 1})).await;
    recv(&mut first).await;

    let (mut second, _) = connect_async(url.as_str()).await.unwrap();
    let event = recv(&mut second).await;
    assert_eq!(event["type"], "error");
    assert_eq!(event["code"], "CAPACITY_EXCEEDED");
}
