use std::collections::HashMap;
use std::sync::Arc;

/// per-wait ceiling: applies to the first fragment and again to every
/// subsequent fragment, never to the exchange as a whole.
const RESPONSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// public request bodies larger than this are rejected with 413.
const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

type TunnelIo = hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>;
type TunnelSocket = iskndr_utils::SafeWebSocket<TunnelIo>;

#[derive(Clone)]
struct ServerState {
    config: Arc<iskndr_server::Config>,
    connections: Arc<iskndr_server::ConnectionStore<TunnelIo>>,
    requests: Arc<iskndr_server::RequestManager>,
    graceful: iskndr_utils::Graceful,
}

/// Binds the public listener and serves until cancelled. `post_start`
/// runs once with the bound port (callers can pass port 0 and learn the
/// real one here).
pub async fn listen(
    config: iskndr_server::Config,
    graceful: iskndr_utils::Graceful,
    post_start: impl FnOnce(u16) -> eyre::Result<()>,
) -> eyre::Result<()> {
    use eyre::WrapErr;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .wrap_err_with(|| {
            format!(
                "can not listen on port {}, is it busy, or you do not have root access?",
                config.port
            )
        })?;

    let port = listener.local_addr()?.port();
    post_start(port)?;

    println!("Listening on http://0.0.0.0:{port}");

    let state = ServerState {
        connections: Arc::new(iskndr_server::ConnectionStore::new(config.max_tunnels)),
        requests: Arc::new(iskndr_server::RequestManager::new(
            config.max_requests_per_tunnel,
        )),
        config: Arc::new(config),
        graceful: graceful.clone(),
    };

    graceful.spawn(listener_loop(listener, state));
    graceful.cancelled().await;
    tracing::info!("Stopping iskndr server.");

    Ok(())
}

async fn listener_loop(listener: tokio::net::TcpListener, state: ServerState) {
    loop {
        tracing::trace!("waiting for connection");

        tokio::select! {
            _ = state.graceful.cancelled() => {
                tracing::info!("Stopping public listener.");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let state = state.clone();
                    let graceful = state.graceful.clone();
                    graceful.spawn(async move { handle_connection(stream, state).await });
                }
                Err(e) => {
                    tracing::error!("failed to accept: {e:?}");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, state: ServerState) {
    let graceful = state.graceful.clone();
    let io = hyper_util::rt::TokioIo::new(stream);

    let builder =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::tokio::TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(
        io,
        hyper::service::service_fn(move |r| handle_request(r, state.clone())),
    );
    tokio::pin!(conn);

    if let Err(e) = tokio::select! {
        _ = graceful.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
        r = &mut conn => r,
    } {
        tracing::debug!("connection error: {e:?}");
    }
}

async fn handle_request(
    r: hyper::Request<hyper::body::Incoming>,
    state: ServerState,
) -> iskndr_utils::ProxyResult {
    let path = r.uri().path().to_string();
    match path.as_str() {
        "/health" => Ok(iskndr_utils::http::bytes_to_resp(
            b"OK".to_vec(),
            hyper::StatusCode::OK,
        )),
        iskndr_utils::TUNNEL_CONNECT_PATH => Ok(handle_tunnel_connect(r, state)),
        _ => {
            use futures_util::FutureExt;

            let start = std::time::Instant::now();
            match std::panic::AssertUnwindSafe(handle_public(r, state, start))
                .catch_unwind()
                .await
            {
                Ok(response) => response,
                Err(_) => {
                    tracing::error!("public request handler panicked");
                    Ok(iskndr_utils::server_error!("Internal server error"))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// tunnel sessions
// ---------------------------------------------------------------------------

fn handle_tunnel_connect(
    mut r: hyper::Request<hyper::body::Incoming>,
    state: ServerState,
) -> iskndr_utils::ProxyResponse {
    let key = match websocket_key(&r) {
        Some(key) => key,
        None => {
            tracing::error!("tunnel connect without a websocket handshake");
            return iskndr_utils::server_error!("Failed to upgrade to websocket");
        }
    };

    // the capacity answer has to go out before the 101: once the
    // connection is upgraded there is no HTTP channel left for an error
    // status. register re-checks under the store lock.
    if state.connections.is_full() {
        tracing::warn!("tunnel capacity reached, rejecting connect");
        return iskndr_utils::http::error_(
            hyper::StatusCode::SERVICE_UNAVAILABLE,
            "Server tunnel capacity reached".to_string(),
        );
    }

    let accept =
        tokio_tungstenite::tungstenite::handshake::derive_accept_key(key.as_bytes());
    let accept = match hyper::header::HeaderValue::from_str(&accept) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("derived accept key is not a header value: {e:?}");
            return iskndr_utils::server_error!("Failed to upgrade to websocket");
        }
    };

    let upgrade = hyper::upgrade::on(&mut r);
    let graceful = state.graceful.clone();
    graceful.spawn(async move { run_tunnel_session(upgrade, state).await });

    let mut response =
        iskndr_utils::http::bytes_to_resp(Vec::new(), hyper::StatusCode::SWITCHING_PROTOCOLS);
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONNECTION,
        hyper::header::HeaderValue::from_static("Upgrade"),
    );
    headers.insert(
        hyper::header::UPGRADE,
        hyper::header::HeaderValue::from_static("websocket"),
    );
    headers.insert(hyper::header::SEC_WEBSOCKET_ACCEPT, accept);
    response
}

fn websocket_key(r: &hyper::Request<hyper::body::Incoming>) -> Option<String> {
    let connection_has_upgrade = r
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_is_websocket = r
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !connection_has_upgrade || !upgrade_is_websocket {
        return None;
    }

    r.headers()
        .get(hyper::header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn run_tunnel_session(upgrade: hyper::upgrade::OnUpgrade, state: ServerState) {
    let upgraded = match upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::error!("tunnel upgrade failed: {e:?}");
            return;
        }
    };

    let ws = tokio_tungstenite::WebSocketStream::from_raw_socket(
        hyper_util::rt::TokioIo::new(upgraded),
        tokio_tungstenite::tungstenite::protocol::Role::Server,
        None,
    )
    .await;
    let channel = Arc::new(iskndr_utils::SafeWebSocket::new(ws));

    let key = match state.connections.register(channel.clone()) {
        Ok(key) => key,
        Err(e) => {
            // lost the race between the pre-upgrade capacity check and the
            // insert; nothing to say to the peer but a close frame.
            tracing::error!("tunnel registration failed: {e}");
            channel.close().await;
            return;
        }
    };

    tracing::info!(subdomain = %key, "tunnel connected");

    if let Err(e) = serve_tunnel(&key, &channel, &state).await {
        tracing::info!(subdomain = %key, "tunnel disconnected: {e}");
    }

    state.connections.remove(&key);
    state.requests.remove_subdomain(&key);
    channel.close().await;
}

/// Sends the registration message and then dispatches response fragments
/// into their mailboxes until the connection dies.
async fn serve_tunnel(
    key: &str,
    channel: &Arc<TunnelSocket>,
    state: &ServerState,
) -> eyre::Result<()> {
    use eyre::WrapErr;

    let public_url = iskndr_utils::compose_public_url(&state.config.public_url_base(), key)?;
    channel
        .write_json(&iskndr_utils::RegisterTunnelMessage {
            subdomain: public_url,
        })
        .await
        .wrap_err_with(|| "failed to send register tunnel message")?;

    loop {
        let msg = tokio::select! {
            _ = state.graceful.cancelled() => return Err(eyre::anyhow!("server shutting down")),
            msg = channel.read_json::<iskndr_utils::Message>() => msg?,
        };

        let id = match &msg {
            iskndr_utils::Message::Response { id, .. } => id.clone(),
            iskndr_utils::Message::Request { id, .. } => {
                tracing::warn!(request_id = %id, "unexpected request message from tunnel, dropping");
                continue;
            }
        };

        match state.requests.lookup(&id) {
            Some(mailbox) => {
                // the sender clone is dropped right after the send; a full
                // mailbox back-pressures this loop on purpose.
                if mailbox.send(msg).await.is_err() {
                    tracing::debug!(request_id = %id, "mailbox closed, dropping late fragment");
                }
            }
            None => {
                tracing::debug!(request_id = %id, "fragment for unknown request, dropping");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// public requests
// ---------------------------------------------------------------------------

/// Removes the mailbox when dropped, wherever the response ends: normal
/// completion, timeout, or the caller going away mid-stream.
struct MailboxGuard {
    requests: Arc<iskndr_server::RequestManager>,
    request_id: String,
    subdomain: String,
}

impl Drop for MailboxGuard {
    fn drop(&mut self) {
        self.requests.remove(&self.request_id, &self.subdomain);
    }
}

async fn handle_public(
    r: hyper::Request<hyper::body::Incoming>,
    state: ServerState,
    start: std::time::Instant,
) -> iskndr_utils::ProxyResult {
    let Some(host) = request_host(&r) else {
        return Ok(iskndr_utils::bad_request!("Invalid subdomain"));
    };
    let Some(subdomain) = extract_subdomain(&host) else {
        tracing::info!(%host, "request host carries no subdomain");
        return Ok(iskndr_utils::bad_request!("Invalid subdomain"));
    };
    let subdomain = subdomain.to_string();

    let Some(tunnel) = state.connections.get(&subdomain) else {
        tracing::info!(subdomain = %subdomain, %host, "no tunnel for request host");
        return Ok(iskndr_utils::not_found!("No tunnel found for subdomain"));
    };

    let method = r.method().to_string();
    let path = r
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut headers = iskndr_utils::flatten_headers(r.headers());
    // the public host routed us here; the origin gets its own
    headers.remove("host");

    let body = match read_body(r.into_body()).await {
        Ok(body) => body,
        Err(BodyError::TooLarge) => {
            tracing::info!(subdomain = %subdomain, "request body over the {MAX_BODY_SIZE} byte ceiling");
            return Ok(iskndr_utils::http::error_(
                hyper::StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large".to_string(),
            ));
        }
        Err(BodyError::Read(e)) => {
            tracing::error!("failed to read request body: {e:?}");
            return Ok(iskndr_utils::server_error!("Failed to read request body"));
        }
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(subdomain = %subdomain, request_id = %request_id, %method, %path, "forwarding public request");

    // mailbox before transmit: a fragment cannot race a mailbox that
    // exists before the request ever leaves this process.
    let mailbox = match state.requests.register(&request_id, &subdomain) {
        Ok(mailbox) => mailbox,
        Err(e) => {
            tracing::warn!(subdomain = %subdomain, "{e}");
            return Ok(iskndr_utils::http::error_(
                hyper::StatusCode::SERVICE_UNAVAILABLE,
                "Tunnel request capacity reached".to_string(),
            ));
        }
    };
    let guard = MailboxGuard {
        requests: state.requests.clone(),
        request_id: request_id.clone(),
        subdomain: subdomain.clone(),
    };

    let message = iskndr_utils::Message::Request {
        id: request_id.clone(),
        method: method.clone(),
        path: path.clone(),
        headers,
        body,
    };
    if let Err(e) = tunnel.write_json(&message).await {
        tracing::error!(request_id = %request_id, subdomain = %subdomain, "failed to forward request: {e:?}");
        return Ok(iskndr_utils::server_error!(
            "Failed to forward request to tunnel"
        ));
    }

    write_proxied_response(mailbox, guard, subdomain, method, path, start).await
}

/// Waits for the first fragment, turns it into the public response, and
/// keeps streaming the rest of the mailbox into the response body.
async fn write_proxied_response(
    mut mailbox: iskndr_server::Mailbox,
    guard: MailboxGuard,
    subdomain: String,
    method: String,
    path: String,
    start: std::time::Instant,
) -> iskndr_utils::ProxyResult {
    let request_id = guard.request_id.clone();

    let first = match tokio::time::timeout(RESPONSE_TIMEOUT, mailbox.recv()).await {
        Err(_) => {
            tracing::warn!(request_id = %request_id, subdomain = %subdomain, %path, "timed out waiting for first response fragment");
            return Ok(iskndr_utils::http::error_(
                hyper::StatusCode::GATEWAY_TIMEOUT,
                "Timeout waiting for response from tunnel".to_string(),
            ));
        }
        Ok(None) => {
            tracing::warn!(request_id = %request_id, subdomain = %subdomain, "mailbox closed before any fragment");
            return Ok(iskndr_utils::http::error_(
                hyper::StatusCode::BAD_GATEWAY,
                "Tunnel not responding".to_string(),
            ));
        }
        Ok(Some(fragment)) => fragment,
    };

    let (status, headers, body, done) = match first {
        iskndr_utils::Message::Response {
            status,
            headers,
            body,
            done,
            ..
        } => (status, headers, body, done),
        iskndr_utils::Message::Request { .. } => {
            tracing::error!(request_id = %request_id, "request fragment delivered to a response mailbox");
            return Ok(iskndr_utils::server_error!(
                "Failed to get response from tunnel"
            ));
        }
    };

    let status = status
        .and_then(|s| hyper::StatusCode::from_u16(s).ok())
        .unwrap_or(hyper::StatusCode::OK);

    tracing::info!(
        subdomain = %subdomain,
        %method,
        %path,
        status = %status,
        elapsed = ?start.elapsed(),
        request_id = %request_id,
        "response"
    );

    if done {
        drop(guard);
        let mut response = iskndr_utils::http::bytes_to_resp(body, status);
        apply_headers(response.headers_mut(), headers);
        return Ok(response);
    }

    tracing::debug!(request_id = %request_id, bytes = body.len(), "streaming started");

    // the first chunk goes out ahead of any further mailbox read; the
    // guard rides inside the stream so the mailbox dies with the body,
    // however the body ends.
    let first_chunk = futures_util::stream::iter([Ok::<_, std::convert::Infallible>(
        hyper::body::Frame::data(hyper::body::Bytes::from(body)),
    )]);
    let tail = futures_util::stream::unfold(
        StreamState {
            mailbox,
            guard,
            request_id,
            start,
            done: false,
        },
        next_body_frame,
    );

    let body = {
        use futures_util::StreamExt;
        use http_body_util::BodyExt;

        http_body_util::StreamBody::new(first_chunk.chain(tail))
            .map_err(|never| match never {})
            .boxed()
    };

    let mut response = hyper::Response::new(body);
    *response.status_mut() = status;
    apply_headers(response.headers_mut(), headers);
    Ok(response)
}

struct StreamState {
    mailbox: iskndr_server::Mailbox,
    #[allow(dead_code)] // held for its Drop
    guard: MailboxGuard,
    request_id: String,
    start: std::time::Instant,
    done: bool,
}

type BodyFrame = Result<hyper::body::Frame<hyper::body::Bytes>, std::convert::Infallible>;

async fn next_body_frame(mut state: StreamState) -> Option<(BodyFrame, StreamState)> {
    if state.done {
        return None;
    }

    match tokio::time::timeout(RESPONSE_TIMEOUT, state.mailbox.recv()).await {
        Err(_) => {
            tracing::warn!(request_id = %state.request_id, "timed out mid-stream, terminating response");
            None
        }
        Ok(None) => {
            tracing::warn!(request_id = %state.request_id, "mailbox closed mid-stream, terminating response");
            None
        }
        Ok(Some(iskndr_utils::Message::Response { body, done, .. })) => {
            if done {
                tracing::info!(request_id = %state.request_id, elapsed = ?state.start.elapsed(), "streaming completed");
                state.done = true;
            } else {
                tracing::debug!(request_id = %state.request_id, bytes = body.len(), elapsed = ?state.start.elapsed(), "streaming chunk");
            }
            Some((
                Ok(hyper::body::Frame::data(hyper::body::Bytes::from(body))),
                state,
            ))
        }
        Ok(Some(iskndr_utils::Message::Request { .. })) => {
            tracing::error!(request_id = %state.request_id, "request fragment delivered to a response mailbox");
            None
        }
    }
}

fn apply_headers(
    dst: &mut hyper::HeaderMap,
    headers: Option<HashMap<String, String>>,
) {
    for (name, value) in headers.unwrap_or_default() {
        let header_name = match hyper::header::HeaderName::from_bytes(name.as_bytes()) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("skipping invalid header name {name}: {e}");
                continue;
            }
        };
        match hyper::header::HeaderValue::from_str(&value) {
            Ok(v) => {
                dst.insert(header_name, v);
            }
            Err(e) => {
                tracing::debug!("skipping invalid value for header {name}: {e}");
            }
        }
    }
}

enum BodyError {
    TooLarge,
    Read(hyper::Error),
}

async fn read_body(body: hyper::body::Incoming) -> Result<Vec<u8>, BodyError> {
    use http_body_util::BodyDataStream;
    use tokio_stream::StreamExt;

    let mut stream = BodyDataStream::new(body);
    let mut buf = bytes::BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buf.len() + chunk.len() > MAX_BODY_SIZE {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.to_vec())
}

fn request_host(r: &hyper::Request<hyper::body::Incoming>) -> Option<String> {
    if let Some(host) = r.uri().host() {
        return Some(host.to_string());
    }
    r.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

/// First dot-separated label of the request host. Hosts with fewer than
/// two labels (`localhost`) have no subdomain to route on.
fn extract_subdomain(host: &str) -> Option<&str> {
    match host.split_once('.') {
        Some((first, rest)) if !first.is_empty() && !rest.is_empty() => Some(first),
        _ => None,
    }
}
