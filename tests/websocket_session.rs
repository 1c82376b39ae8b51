//! End-to-end: real axum server, WebSocket client, HTTP ingestion.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use avs_rag::config::RagConfig;
use avs_rag::embeddings::HashedEmbeddings;
use avs_rag::generation::{Script, ScriptedGeneration};
use avs_rag::server::{AppState, build_router};
use avs_rag::template::PromptTemplate;
use futures::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn spawn_server(generator: Arc<ScriptedGeneration>) -> SocketAddr {
    let _ = tracing_subscriber::fmt::try_init();
    let state = Arc::new(AppState::new(
        RagConfig::default(),
        Arc::new(HashedEmbeddings::new(512)),
        generator,
        PromptTemplate::default(),
    ));
    let app = build_router(state).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn uploaded_document_grounds_streamed_answer() {
    let generator = Arc::new(ScriptedGeneration::new(Script::reply([
        "Ferris",
        " is a crab.",
    ])));
    let addr = spawn_server(generator.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/upload"))
        .header("content-type", "text/plain")
        .body("Ferris is the mascot. Ferris is a crab\nBananas are yellow")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["chunks"], 3);

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws/prompt")).await.unwrap();
    socket
        .send(Message::Text(r#"{"content": "What is Ferris?"}"#.into()))
        .await
        .unwrap();

    let mut events = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        let Message::Text(text) = frame else {
            continue;
        };
        let event: JsonValue = serde_json::from_str(&text).unwrap();
        let done = event["type"] == "done";
        events.push(event);
        if done {
            break;
        }
    }

    let kinds: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();
    assert_eq!(kinds, vec!["message", "message", "done"]);
    assert_eq!(events[0]["content"], "Ferris");
    assert_eq!(events[1]["content"], " is a crab.");

    let request = &generator.requests()[0];
    assert!(request[0].content.contains("Ferris is the mascot"));
    assert!(!request[0].content.contains("Bananas"));

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn malformed_frame_gets_error_event_over_websocket() {
    let generator = Arc::new(ScriptedGeneration::new(Script::reply(["unused"])));
    let addr = spawn_server(generator.clone()).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws/prompt")).await.unwrap();
    socket.send(Message::Text("not json".into())).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed")
        .unwrap();
    let event: JsonValue = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(event["type"], "error");
    assert_eq!(generator.calls(), 0);
}
