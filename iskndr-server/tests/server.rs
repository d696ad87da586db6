//! End-to-end tests for the public ingress: a raw websocket stands in
//! for the tunnel client, reqwest for the public caller.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn test_config(max_tunnels: usize) -> iskndr_server::Config {
    iskndr_server::Config {
        base_scheme: "http".to_string(),
        base_domain: "localhost.direct:8080".to_string(),
        port: 0,
        logging: false,
        max_tunnels,
        max_requests_per_tunnel: 8,
    }
}

async fn start_server(max_tunnels: usize) -> (u16, iskndr_utils::Graceful) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (port_tx, port_rx) = tokio::sync::oneshot::channel();
    let graceful = iskndr_utils::Graceful::new();
    let graceful_for_listen = graceful.clone();
    graceful.spawn(async move {
        let result = iskndr_server::listen(test_config(max_tunnels), graceful_for_listen, |port| {
            let _ = port_tx.send(port);
            Ok(())
        })
        .await;
        if let Err(e) = result {
            panic!("server failed to start: {e:?}");
        }
    });

    let port = port_rx.await.expect("server did not report its port");
    (port, graceful)
}

/// Dials the control endpoint and reads the registration message.
async fn connect_tunnel(port: u16) -> (WsStream, String) {
    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel/connect"))
            .await
            .expect("should connect to websocket");

    let registration = match ws.next().await {
        Some(Ok(WsMessage::Text(text))) => text,
        other => panic!("expected registration message, got {other:?}"),
    };
    let registration: iskndr_utils::RegisterTunnelMessage =
        serde_json::from_str(registration.as_str()).unwrap();

    (ws, registration.subdomain)
}

/// `http://abc12345.localhost.direct:8080` → `abc12345.localhost.direct:8080`.
fn public_host(subdomain_url: &str) -> String {
    subdomain_url
        .strip_prefix("http://")
        .expect("registration carries an http URL")
        .to_string()
}

async fn read_request(ws: &mut WsStream) -> iskndr_utils::Message {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return serde_json::from_str(text.as_str()).unwrap();
            }
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
            other => panic!("expected a request message, got {other:?}"),
        }
    }
}

async fn send_fragment(ws: &mut WsStream, msg: &iskndr_utils::Message) {
    ws.send(WsMessage::Text(serde_json::to_string(msg).unwrap().into()))
        .await
        .expect("fragment should send");
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_carries_a_public_url() {
    let (port, graceful) = start_server(10).await;

    let (_ws, subdomain_url) = connect_tunnel(port).await;
    assert!(subdomain_url.starts_with("http://"));

    let key = subdomain_url
        .strip_prefix("http://")
        .and_then(|rest| rest.split('.').next())
        .unwrap();
    assert_eq!(key.len(), iskndr_utils::SUBDOMAIN_KEY_LENGTH);
    assert!(
        key.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    );
    assert!(subdomain_url.ends_with(".localhost.direct:8080"));

    graceful.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn health_endpoint_answers_ok() {
    let (port, graceful) = start_server(10).await;

    let res = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "OK");

    graceful.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn proxies_a_request_through_the_tunnel() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (port, graceful) = start_server(10).await;
        let (mut ws, subdomain_url) = connect_tunnel(port).await;
        let host = public_host(&subdomain_url);

        let tunnel = tokio::spawn(async move {
            let request = read_request(&mut ws).await;
            let id = match &request {
                iskndr_utils::Message::Request { id, method, path, .. } => {
                    assert_eq!(method, "GET");
                    assert_eq!(path, "/hello");
                    id.clone()
                }
                other => panic!("expected a request, got {other:?}"),
            };
            send_fragment(
                &mut ws,
                &iskndr_utils::Message::Response {
                    id,
                    status: Some(200),
                    headers: Some(
                        [("content-type".to_string(), "text/plain".to_string())].into(),
                    ),
                    body: b"world".to_vec(),
                    done: true,
                },
            )
            .await;
        });

        let res = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{port}/hello"))
            .header(reqwest::header::HOST, host)
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), 200);
        assert_eq!(
            res.headers().get("content-type").unwrap().to_str().unwrap(),
            "text/plain"
        );
        assert_eq!(res.text().await.unwrap(), "world");

        tunnel.await.unwrap();
        graceful.cancel();
    })
    .await
    .expect("proxies_a_request_through_the_tunnel timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_fragments_before_completion() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (port, graceful) = start_server(10).await;
        let (mut ws, subdomain_url) = connect_tunnel(port).await;
        let host = public_host(&subdomain_url);

        let delay = Duration::from_millis(150);
        let tunnel = tokio::spawn(async move {
            let request = read_request(&mut ws).await;
            let id = request.id().to_string();
            send_fragment(
                &mut ws,
                &iskndr_utils::Message::Response {
                    id: id.clone(),
                    status: Some(200),
                    headers: Some(
                        [("content-type".to_string(), "text/plain".to_string())].into(),
                    ),
                    body: b"Hello".to_vec(),
                    done: false,
                },
            )
            .await;
            tokio::time::sleep(delay).await;
            send_fragment(
                &mut ws,
                &iskndr_utils::Message::Response {
                    id,
                    status: None,
                    headers: None,
                    body: b", World!".to_vec(),
                    done: true,
                },
            )
            .await;
        });

        let mut res = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{port}/stream"))
            .header(reqwest::header::HOST, host)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);

        let first = res.chunk().await.unwrap().expect("first chunk");
        let first_seen_at = std::time::Instant::now();
        assert_eq!(&first[..], b"Hello");

        let mut rest = Vec::new();
        while let Some(chunk) = res.chunk().await.unwrap() {
            if rest.is_empty() && !chunk.is_empty() {
                // the second fragment must arrive measurably later than the
                // first: proof the first write was flushed immediately
                assert!(
                    first_seen_at.elapsed() >= Duration::from_millis(50),
                    "second chunk arrived too soon after the first"
                );
            }
            rest.extend_from_slice(&chunk);
        }
        assert_eq!(&rest[..], b", World!");

        tunnel.await.unwrap();
        graceful.cancel();
    })
    .await
    .expect("streams_fragments_before_completion timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_subdomain_is_404() {
    let (port, graceful) = start_server(10).await;

    let res = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/test-path"))
        .header(reqwest::header::HOST, "ghost.localhost.direct")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 404);
    assert_eq!(res.text().await.unwrap(), "No tunnel found for subdomain\n");

    graceful.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn host_without_subdomain_is_400() {
    let (port, graceful) = start_server(10).await;

    let res = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/test-path"))
        .header(reqwest::header::HOST, "localhost")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 400);
    assert_eq!(res.text().await.unwrap(), "Invalid subdomain\n");

    graceful.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_body_is_413() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (port, graceful) = start_server(10).await;
        let (_ws, subdomain_url) = connect_tunnel(port).await;
        let host = public_host(&subdomain_url);

        let res = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/upload"))
            .header(reqwest::header::HOST, host)
            .body(vec![0u8; 5 * 1024 * 1024])
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), 413);

        graceful.cancel();
    })
    .await
    .expect("oversized_body_is_413 timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_tunnel_fails_fast_with_502() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (port, graceful) = start_server(10).await;
        let (mut ws, subdomain_url) = connect_tunnel(port).await;
        let host = public_host(&subdomain_url);

        // swallow the request, then drop the session without answering
        let tunnel = tokio::spawn(async move {
            let _request = read_request(&mut ws).await;
            ws.close(None).await.unwrap();
        });

        let res = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{port}/hello"))
            .header(reqwest::header::HOST, host)
            .send()
            .await
            .unwrap();

        assert_eq!(res.status(), 502);
        assert_eq!(res.text().await.unwrap(), "Tunnel not responding\n");

        tunnel.await.unwrap();
        graceful.cancel();
    })
    .await
    .expect("dead_tunnel_fails_fast_with_502 timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn tunnel_capacity_is_refused_with_503() {
    let (port, graceful) = start_server(1).await;

    let (_ws, _subdomain_url) = connect_tunnel(port).await;

    let err = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tunnel/connect"))
        .await
        .expect_err("second tunnel must be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 503);
        }
        other => panic!("expected an HTTP error, got {other:?}"),
    }

    graceful.cancel();
}
