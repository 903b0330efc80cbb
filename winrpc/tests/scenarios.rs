//! End-to-end scenarios (§8) wired through a real `Client` and `Server`
//! pair connected over an in-process `MemSource` channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use winrpc::{
    create_client, create_server, ClientOptions, FileValue, RequestConfig, ServerOptions,
};
use winrpc_core::channel::mem::MemSource;
use winrpc_core::{clear_channel_pool, EndpointOptions};

fn connected_pair() -> (Arc<winrpc::Client>, Arc<winrpc::Server>) {
    clear_channel_pool();
    let (client_side, server_side) = MemSource::pair();
    let client = create_client(Arc::new(client_side), EndpointOptions::default(), ClientOptions::default());
    let server = create_server(Arc::new(server_side), EndpointOptions::default(), ServerOptions::default());
    (client, server)
}

#[tokio::test]
async fn basic_request_response() {
    let (client, server) = connected_pair();
    server.router.route(
        "/echo",
        Arc::new(|req, res| {
            Box::pin(async move {
                res.json(req.body.unwrap_or(serde_json::Value::Null)).await;
                Ok(())
            })
        }),
    );

    let response = client
        .send(RequestConfig::new("/echo").with_body(serde_json::json!({"ok": true})))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.data, Some(serde_json::json!({"ok": true})));
}

#[tokio::test]
async fn ack_timeout_when_no_server_is_listening() {
    clear_channel_pool();
    let (client_side, _server_side) = MemSource::pair();
    let options = ClientOptions { ack_timeout: Duration::from_millis(100), ..ClientOptions::default() };
    let client = create_client(Arc::new(client_side), EndpointOptions::default(), options);

    let result = client.send(RequestConfig::new("/nobody-home")).await;
    assert!(matches!(result, Err(err) if err.code == winrpc_core::ErrorCode::AckTimeout));
}

#[tokio::test]
async fn path_parameters_are_captured() {
    let (client, server) = connected_pair();
    server.router.route(
        "/api/users/:id",
        Arc::new(|req, res| {
            Box::pin(async move {
                let id = req.params.get("id").cloned().unwrap_or_default();
                res.json(serde_json::json!({"id": id, "path": req.path})).await;
                Ok(())
            })
        }),
    );

    let response = client.send(RequestConfig::new("/api/users/42")).await.unwrap();
    assert_eq!(response.data, Some(serde_json::json!({"id": "42", "path": "/api/users/42"})));
}

#[tokio::test]
async fn file_auto_resolve_surfaces_as_request_file() {
    let (client, server) = connected_pair();
    server.router.route(
        "/upload",
        Arc::new(|req, res| {
            Box::pin(async move {
                let text = req.file.as_ref().and_then(|f| f.text()).unwrap_or_default();
                assert!(req.stream.is_none());
                res.json(serde_json::json!({"received": text})).await;
                Ok(())
            })
        }),
    );

    let response = client
        .send_file(RequestConfig::new("/upload"), FileValue::new("Hello").with_file_name("a.txt").with_mime_type("text/plain"))
        .await
        .unwrap();

    assert_eq!(response.data, Some(serde_json::json!({"received": "Hello"})));
}

#[tokio::test]
async fn pull_mode_stream_delivers_chunks_in_order() {
    let (client, server) = connected_pair();
    server.router.route(
        "/stream",
        Arc::new(|_req, res| {
            Box::pin(async move {
                let writer = res.writer(winrpc_core::WriterOptions::default());
                let chunks = ["c1", "c2", "c3"];
                for (i, chunk) in chunks.iter().enumerate() {
                    let done = i == chunks.len() - 1;
                    let _ = writer.write(serde_json::json!(chunk), done);
                }
                res.send_stream(writer).await;
                Ok(())
            })
        }),
    );

    let response = client.send(RequestConfig::new("/stream")).await.unwrap();
    let reader = response.stream.expect("server should have replied with a stream");
    let chunks = reader.read_all().await.unwrap();
    assert_eq!(chunks, vec![serde_json::json!("c1"), serde_json::json!("c2"), serde_json::json!("c3")]);
}

#[tokio::test]
async fn concurrency_cap_rejects_second_in_flight_request() {
    clear_channel_pool();
    let (client_side, server_side) = MemSource::pair();
    let client = create_client(Arc::new(client_side), EndpointOptions::default(), ClientOptions::default());
    let server = create_server(
        Arc::new(server_side),
        EndpointOptions::default(),
        ServerOptions { max_concurrent_requests_per_client: Some(1) },
    );
    server.router.route(
        "/slow",
        Arc::new(|_req, res| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                res.json(serde_json::json!({"ok": true})).await;
                Ok(())
            })
        }),
    );

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.send(RequestConfig::new("/slow")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = client.send(RequestConfig::new("/slow")).await;

    assert!(matches!(second, Err(err) if err.code == winrpc_core::ErrorCode::TooManyRequests));
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn per_frame_stream_acks_resolve() {
    let (client, server) = connected_pair();
    server.router.route(
        "/acked-stream",
        Arc::new(|req, res| {
            Box::pin(async move {
                let writer = res.writer(winrpc_core::WriterOptions::default());
                let binding = winrpc_core::StreamBinding {
                    stream_id: writer.stream_id().to_string(),
                    request_id: req.request_id.clone(),
                    role: winrpc_core::Role::Server,
                    creator_id: req.creator_id.clone().unwrap_or_default(),
                    target_id: req.target_id.clone(),
                };
                writer.start(binding).await.unwrap();
                let ack1 = writer.write_with_ack(serde_json::json!("c1"), Duration::from_millis(500)).await.unwrap();
                let ack2 = writer.write_with_ack(serde_json::json!("c2"), Duration::from_millis(500)).await.unwrap();
                writer.end().unwrap();
                assert!(ack1, "first chunk should be acked by the reader");
                assert!(ack2, "second chunk should be acked by the reader");
                Ok(())
            })
        }),
    );

    let response = client.send(RequestConfig::new("/acked-stream")).await.unwrap();
    let reader = response.stream.expect("server should have replied with a stream");
    let chunks = reader.read_all().await.unwrap();
    assert_eq!(chunks, vec![serde_json::json!("c1"), serde_json::json!("c2")]);
}

#[tokio::test]
async fn require_ack_response_round_trips_via_received() {
    let (client, server) = connected_pair();
    server.router.route(
        "/ack-me",
        Arc::new(|_req, res| {
            Box::pin(async move {
                let acked = res.send(serde_json::json!({"ok": true}), true, Duration::from_millis(500)).await;
                assert!(acked, "client should reply with received before the timeout");
                Ok(())
            })
        }),
    );

    let response = client.send(RequestConfig::new("/ack-me")).await.unwrap();
    assert_eq!(response.data, Some(serde_json::json!({"ok": true})));
}

#[tokio::test]
async fn stream_recovers_from_idle_timeout_via_heartbeat() {
    let (client, server) = connected_pair();
    server.router.route(
        "/idle-stream",
        Arc::new(|req, res| {
            Box::pin(async move {
                let options = winrpc_core::WriterOptions {
                    idle_timeout: Duration::from_millis(50),
                    ..winrpc_core::WriterOptions::default()
                };
                let writer = res.writer(options);
                let binding = winrpc_core::StreamBinding {
                    stream_id: writer.stream_id().to_string(),
                    request_id: req.request_id.clone(),
                    role: winrpc_core::Role::Server,
                    creator_id: req.creator_id.clone().unwrap_or_default(),
                    target_id: req.target_id.clone(),
                };
                writer.start(binding).await.unwrap();
                writer.write(serde_json::json!("first"), false).unwrap();
                tokio::time::sleep(Duration::from_millis(200)).await;
                assert_eq!(writer.state(), winrpc_core::StreamState::Streaming, "idle stream should have survived via heartbeat recovery");
                writer.write(serde_json::json!("second"), true).unwrap();
                Ok(())
            })
        }),
    );

    let response = client.send(RequestConfig::new("/idle-stream")).await.unwrap();
    let reader = response.stream.expect("server should have replied with a stream");
    let chunks = reader.read_all().await.unwrap();
    assert_eq!(chunks, vec![serde_json::json!("first"), serde_json::json!("second")]);
}

#[tokio::test]
async fn middleware_short_circuit_skips_route_handler() {
    let (client, server) = connected_pair();
    let route_hit = Arc::new(AtomicBool::new(false));
    let route_hit_for_middleware = route_hit.clone();
    server.router.use_middleware(
        None,
        Arc::new(move |_req, res, _next| {
            let route_hit = route_hit_for_middleware.clone();
            Box::pin(async move {
                assert!(!route_hit.load(Ordering::SeqCst), "middleware runs before the route handler");
                res.json(serde_json::json!({"blocked": true})).await;
                Ok(())
            })
        }),
    );
    let route_hit_for_route = route_hit.clone();
    server.router.route(
        "/guarded",
        Arc::new(move |_req, res| {
            let route_hit = route_hit_for_route.clone();
            Box::pin(async move {
                route_hit.store(true, Ordering::SeqCst);
                res.json(serde_json::json!({"reached": true})).await;
                Ok(())
            })
        }),
    );

    let response = client.send(RequestConfig::new("/guarded")).await.unwrap();
    assert_eq!(response.data, Some(serde_json::json!({"blocked": true})));
    assert!(!route_hit.load(Ordering::SeqCst), "short-circuited middleware must prevent the route handler from running");
}
