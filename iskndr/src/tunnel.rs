pub type ClientWebSocket =
    iskndr_utils::SafeWebSocket<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// An established control channel plus the public URL the server
/// assigned to it.
pub struct TunnelSession {
    pub channel: std::sync::Arc<ClientWebSocket>,
    pub public_url: String,
}

/// Dials the tunnel server and waits for the one registration message
/// that carries our public URL. Errors here are fatal for the CLI.
pub async fn connect(server_url: &str, allow_insecure: bool) -> eyre::Result<TunnelSession> {
    use eyre::WrapErr;

    let connector = if allow_insecure {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .wrap_err_with(|| "failed to build TLS connector")?;
        Some(tokio_tungstenite::Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws, _) =
        tokio_tungstenite::connect_async_tls_with_config(server_url, None, false, connector)
            .await
            .wrap_err_with(|| format!("failed to connect to websocket at {server_url}"))?;

    let channel = std::sync::Arc::new(iskndr_utils::SafeWebSocket::new(ws));

    let registration: iskndr_utils::RegisterTunnelMessage = channel
        .read_json()
        .await
        .wrap_err_with(|| "failed to read register tunnel message")?;

    tracing::info!(public_url = %registration.subdomain, "tunnel connected");

    Ok(TunnelSession {
        channel,
        public_url: registration.subdomain,
    })
}

/// Reads request messages until the connection drops or we are
/// cancelled, spawning one forwarder per request.
pub async fn run(
    session: TunnelSession,
    destination: String,
    graceful: iskndr_utils::Graceful,
) -> eyre::Result<()> {
    use eyre::WrapErr;

    let client = reqwest::Client::new();

    loop {
        let msg = tokio::select! {
            _ = graceful.cancelled() => {
                tracing::info!("shutting down tunnel");
                session.channel.close().await;
                return Ok(());
            }
            msg = session.channel.read_json::<iskndr_utils::Message>() => {
                msg.wrap_err_with(|| "failed to read request message")?
            }
        };

        match msg {
            iskndr_utils::Message::Request {
                id,
                method,
                path,
                headers,
                body,
            } => {
                tracing::info!(request_id = %id, %method, %path, "request received");
                let channel = session.channel.clone();
                let client = client.clone();
                let destination = destination.clone();
                graceful.spawn(async move {
                    iskndr::forward::send_response(
                        channel,
                        client,
                        &destination,
                        id,
                        method,
                        path,
                        headers,
                        body,
                    )
                    .await;
                });
            }
            iskndr_utils::Message::Response { id, .. } => {
                tracing::warn!(request_id = %id, "unexpected response message from server, dropping");
            }
        }
    }
}
