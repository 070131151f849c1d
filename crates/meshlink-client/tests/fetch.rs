mod common;

use bytes::Bytes;
use common::{init_tracing, running_client, Recorder};
use http::{HeaderMap, Method, Request, StatusCode};
use meshlink_client::{ConnectionState, ControlError, MeshClient, MeshConfig};
use meshlink_proto::{BackendEvent, NetMap};
use meshlink_transport::mock::MockBackend;
use meshlink_transport::{TransportError, TransportResponse};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn get(uri: &str) -> Request<Bytes> {
    Request::get(uri).body(Bytes::new()).unwrap()
}

fn chunked(chunks: &[&'static str]) -> TransportResponse {
    TransportResponse::from_chunks(
        StatusCode::OK,
        HeaderMap::new(),
        chunks.iter().map(|c| Bytes::from_static(c.as_bytes())).collect(),
    )
}

#[tokio::test]
async fn test_fetch_before_start_never_reaches_transport() {
    init_tracing();

    let backend = MockBackend::new().with_http_handler(|_| Ok(chunked(&["unreachable"])));
    let client = MeshClient::new(Arc::new(backend.clone()));

    let err = client.fetch(get("http://100.64.0.2/")).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::NotConnected {
            state: ConnectionState::NoState,
            locked_out: false
        }
    ));
    assert_eq!(backend.round_trips(), 0);
}

#[tokio::test]
async fn test_fetch_while_needing_login_is_rejected() {
    init_tracing();

    let backend = MockBackend::new().with_http_handler(|_| Ok(chunked(&["unreachable"])));
    let client = MeshClient::new(Arc::new(backend.clone()));
    let (recorder, mut notes) = Recorder::new();
    client.start(MeshConfig::default(), recorder).unwrap();
    notes.wait_state(ConnectionState::NeedsLogin).await;

    let err = client.fetch(get("http://100.64.0.2/")).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::NotConnected {
            state: ConnectionState::NeedsLogin,
            ..
        }
    ));
    assert_eq!(backend.round_trips(), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_fetch_streams_response() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let backend = MockBackend::new().with_http_handler(move |request| {
        recorded.lock().unwrap().push((
            request.method().clone(),
            request.uri().to_string(),
            request.headers().get("x-trace").cloned(),
            request.body().clone(),
        ));
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        Ok(TransportResponse::from_chunks(
            StatusCode::CREATED,
            headers,
            vec![Bytes::from_static(b"stored "), Bytes::from_static(b"ok")],
        ))
    });
    let (client, _recorder, _notes) = running_client(backend.clone()).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("http://peer-1.mesh.example/upload")
        .header("x-trace", "abc")
        .body(Bytes::from_static(b"payload"))
        .unwrap();
    let response = client.fetch(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.status_text(), "Created");
    assert!(response.ok());
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "stored ok");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, Method::POST);
    assert_eq!(seen[0].1, "http://peer-1.mesh.example/upload");
    assert_eq!(seen[0].2.as_ref().unwrap(), "abc");
    assert_eq!(seen[0].3, Bytes::from_static(b"payload"));
    drop(seen);

    client.shutdown().await;
}

#[tokio::test]
async fn test_clone_then_drain_both() {
    let backend = MockBackend::new().with_http_handler(|_| Ok(chunked(&["{\"a\":", "1}"])));
    let (client, _recorder, _notes) = running_client(backend).await;

    let response = client.fetch(get("http://100.64.0.2/a")).await.unwrap();
    let copy = response.try_clone().unwrap();

    let original_text = response.text().await.unwrap();
    let copy_value: serde_json::Value = copy.json().await.unwrap();

    assert_eq!(original_text, "{\"a\":1}");
    assert_eq!(copy_value["a"], 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_double_read_fails() {
    let backend = MockBackend::new().with_http_handler(|_| Ok(chunked(&["once"])));
    let (client, _recorder, _notes) = running_client(backend).await;

    let response = client.fetch(get("http://100.64.0.2/")).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "once");
    assert!(matches!(
        response.text().await,
        Err(ControlError::BodyAlreadyConsumed)
    ));
    assert!(matches!(
        response.try_clone(),
        Err(ControlError::BodyAlreadyConsumed)
    ));

    client.shutdown().await;
}

#[tokio::test]
async fn test_transport_error_is_returned() {
    let backend = MockBackend::new().with_http_handler(|_| {
        Err(TransportError::ConnectionError("peer unreachable".to_string()))
    });
    let (client, _recorder, _notes) = running_client(backend).await;

    let err = client.fetch(get("http://100.64.0.9/")).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::Transport(TransportError::ConnectionError(_))
    ));
    assert!(err.is_recoverable());

    client.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_fetch() {
    let backend = MockBackend::new().with_http_handler(|_| Ok(chunked(&["late"])));
    let (client, _recorder, _notes) = running_client(backend.clone()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = client
        .fetch_with_cancel(get("http://100.64.0.2/"), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Cancelled));
    assert_eq!(backend.round_trips(), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_locked_out_blocks_fetch() {
    let backend = MockBackend::new().with_http_handler(|_| Ok(chunked(&["nope"])));
    let (client, _recorder, mut notes) = running_client(backend.clone()).await;

    let mut locked = NetMap::from_json(common::NETMAP).unwrap();
    locked.locked_out = true;
    backend.emit(BackendEvent::NetMap {
        payload: locked.to_json().unwrap(),
    });
    let netmap = notes.wait_net_map().await;
    assert!(netmap.locked_out);

    let err = client.fetch(get("http://100.64.0.2/")).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::NotConnected {
            state: ConnectionState::Running,
            locked_out: true
        }
    ));
    assert_eq!(backend.round_trips(), 0);

    client.shutdown().await;
}
