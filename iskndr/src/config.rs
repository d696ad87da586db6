/// Turns the CLI destination argument into the base URL of the local
/// origin. Accepted forms: a bare port (`8080`, forwarded to localhost)
/// or `host:port`.
pub fn parse_destination(destination: &str) -> eyre::Result<String> {
    if !destination.is_empty() && destination.chars().all(|c| c.is_ascii_digit()) {
        let port = parse_port(destination)?;
        return Ok(format!("http://localhost:{port}"));
    }

    match destination.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains([':', '/']) => {
            let port = parse_port(port)?;
            Ok(format!("http://{host}:{port}"))
        }
        _ => Err(eyre::anyhow!(
            "invalid destination {destination}: expected <port> or <host>:<port>"
        )),
    }
}

fn parse_port(s: &str) -> eyre::Result<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(eyre::anyhow!("invalid port {s}: expected 1-65535")),
        Ok(port) => Ok(port),
    }
}

/// Normalizes the `--server` argument to the control websocket URL.
/// `host:port` and `http://…` dial `ws://`; `https://…` dials `wss://`.
pub fn parse_server_url(server: &str) -> eyre::Result<String> {
    let (scheme, rest) = if let Some(rest) = server.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = server.strip_prefix("http://") {
        ("ws", rest)
    } else if server.contains("://") {
        return Err(eyre::anyhow!(
            "unsupported scheme in server URL {server}: use host:port, http:// or https://"
        ));
    } else {
        ("ws", server)
    };

    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(eyre::anyhow!("invalid server URL: {server}"));
    }

    Ok(format!(
        "{scheme}://{rest}{}",
        iskndr_utils::TUNNEL_CONNECT_PATH
    ))
}
