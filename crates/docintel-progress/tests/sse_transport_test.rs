//! Tests for the SSE transport against a mock HTTP server.

use docintel_abstraction::{CORRELATION_ID_HEADER, CorrelationId, Stage};
use docintel_progress::{
    RawEvent, SseTransport, StreamTransport, TransportError, TransportEvent, TransportHandle,
};

async fn collect(mut handle: TransportHandle) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_stream_delivers_frames_then_closed() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        ": connected\n\n",
        "data: {\"type\":\"processing_update\",\"stage\":\"analyzing_query\",",
        "\"message\":\"Analyzing your question...\"}\n\n",
        "data: {\"type\":\"keepalive\"}\n\n",
        "event: token\ndata: {\"content\":\"Revenue\"}\n\n",
        "data: {\"type\":\"processing_update\",\"stage\":\"retrieving\",",
        "\"message\":\"Found 8 relevant chunks\",\"finished\":true}\n\n",
    );
    let mock = server
        .mock("GET", "/sessions/s1/stream/cid-1")
        .match_header("accept", "text/event-stream")
        .match_header(CORRELATION_ID_HEADER, "cid-1")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let transport = SseTransport::new(server.url()).unwrap();
    let events = collect(transport.open("s1", &CorrelationId::from("cid-1")).await).await;

    assert_eq!(events.len(), 4);
    let TransportEvent::Event(RawEvent::Update(first)) = &events[0] else {
        panic!("expected update, got {:?}", events[0]);
    };
    assert_eq!(first.stage, Stage::Analyzing);
    assert_eq!(events[1], TransportEvent::Event(RawEvent::Token("Revenue".to_string())));
    let TransportEvent::Event(RawEvent::Update(third)) = &events[2] else {
        panic!("expected update, got {:?}", events[2]);
    };
    assert_eq!(third.stage, Stage::Retrieving);
    assert!(third.finished);
    assert_eq!(events[3], TransportEvent::Error(TransportError::Closed));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unknown_stream_is_structural() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/sessions/s1/stream/cid-404")
        .with_status(404)
        .create_async()
        .await;

    let transport = SseTransport::new(server.url()).unwrap();
    let events = collect(transport.open("s1", &CorrelationId::from("cid-404")).await).await;

    assert_eq!(events.len(), 1);
    let TransportEvent::Error(error) = &events[0] else { panic!("expected error") };
    assert_eq!(*error, TransportError::StreamNotFound("cid-404".to_string()));
    assert!(error.is_structural());
}

#[tokio::test]
async fn test_server_error_is_status() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/sessions/s1/stream/cid-1")
        .with_status(503)
        .create_async()
        .await;

    let transport = SseTransport::new(server.url()).unwrap();
    let events = collect(transport.open("s1", &CorrelationId::from("cid-1")).await).await;

    assert_eq!(events, vec![TransportEvent::Error(TransportError::Status(503))]);
}

#[tokio::test]
async fn test_malformed_frame_ends_connection() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "data: {\"type\":\"update\",\"stage\":\"analyzing\",\"message\":\"a\"}\n\n",
        "data: {broken\n\n",
        "data: {\"type\":\"update\",\"stage\":\"generating\",\"message\":\"g\"}\n\n",
    );
    let _mock = server
        .mock("GET", "/sessions/s1/stream/cid-1")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let transport = SseTransport::new(server.url()).unwrap();
    let events = collect(transport.open("s1", &CorrelationId::from("cid-1")).await).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], TransportEvent::Event(RawEvent::Update(_))));
    assert!(matches!(events[1], TransportEvent::Error(TransportError::Decode(_))));
}

#[tokio::test]
async fn test_connection_refused_is_connect_error() {
    let transport = SseTransport::new("http://127.0.0.1:1").unwrap();
    let events = collect(transport.open("s1", &CorrelationId::generate()).await).await;

    assert!(matches!(events.as_slice(), [TransportEvent::Error(TransportError::Connect(_))]));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/sessions/s1/stream/cid-1")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("data: {\"type\":\"update\",\"stage\":\"analyzing\",\"message\":\"a\"}\n\n")
        .create_async()
        .await;

    let transport = SseTransport::new(server.url()).unwrap();
    let mut handle = transport.open("s1", &CorrelationId::from("cid-1")).await;

    assert!(handle.close());
    assert!(!handle.close());
    assert!(handle.is_closed());
    assert!(handle.next_event().await.is_none());
}
