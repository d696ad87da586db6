use std::collections::HashMap;

/// origin bodies are cut into fragments of at most this many bytes.
const CHUNK_SIZE: usize = 32 * 1024;

/// Performs the local HTTP call for one tunneled request and streams the
/// response back as fragments, the last one marked done. Every fragment
/// is emitted as soon as its bytes arrive from the origin.
#[allow(clippy::too_many_arguments)]
pub async fn send_response(
    channel: std::sync::Arc<iskndr::ClientWebSocket>,
    client: reqwest::Client,
    destination: &str,
    id: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
) {
    tracing::info!(request_id = %id, %method, "forwarding to {destination}{path}");

    let request = match build_request(&client, destination, &method, &path, &headers, body) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(request_id = %id, "failed to create local request: {e:?}");
            send_error_fragment(&channel, &id, 500, format!("Failed to create request: {e}"))
                .await;
            return;
        }
    };

    let mut response = match client.execute(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(request_id = %id, "local request failed: {e:?}");
            send_error_fragment(&channel, &id, 502, format!("Failed to reach local app: {e}"))
                .await;
            return;
        }
    };

    let status = response.status().as_u16();
    let headers = iskndr_utils::flatten_headers(response.headers());
    tracing::info!(request_id = %id, status, "local response received");

    let mut first_fragment = true;

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                for piece in split_chunks(chunk) {
                    emit_fragment(
                        &channel,
                        &id,
                        &mut first_fragment,
                        status,
                        &headers,
                        piece,
                        false,
                    )
                    .await;
                }
            }
            Ok(None) => {
                // terminal fragment; carries status and headers too when
                // the body was empty
                emit_fragment(
                    &channel,
                    &id,
                    &mut first_fragment,
                    status,
                    &headers,
                    bytes::Bytes::new(),
                    true,
                )
                .await;
                tracing::info!(request_id = %id, status, "response sent");
                break;
            }
            Err(e) => {
                if first_fragment {
                    tracing::error!(request_id = %id, "failed to read response body: {e:?}");
                    send_error_fragment(
                        &channel,
                        &id,
                        502,
                        format!("Failed to read response body: {e}"),
                    )
                    .await;
                } else {
                    // status already went out; nothing graceful left to send
                    tracing::error!(request_id = %id, "error reading response body mid-stream: {e:?}");
                }
                break;
            }
        }
    }
}

fn build_request(
    client: &reqwest::Client,
    destination: &str,
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    body: Vec<u8>,
) -> eyre::Result<reqwest::Request> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| eyre::anyhow!("invalid method {method}: {e}"))?;

    let mut request = client.request(method, format!("{destination}{path}"));
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    request
        .body(body)
        .build()
        .map_err(|e| eyre::anyhow!("failed to build request: {e}"))
}

async fn emit_fragment(
    channel: &iskndr::ClientWebSocket,
    id: &str,
    first_fragment: &mut bool,
    status: u16,
    headers: &HashMap<String, String>,
    body: bytes::Bytes,
    done: bool,
) {
    // zero-byte fragments say nothing unless they carry the status or done
    if body.is_empty() && !done && !*first_fragment {
        return;
    }

    let message = if *first_fragment {
        *first_fragment = false;
        iskndr_utils::Message::Response {
            id: id.to_string(),
            status: Some(status),
            headers: Some(headers.clone()),
            body: body.to_vec(),
            done,
        }
    } else {
        tracing::debug!(request_id = %id, bytes = body.len(), done, "streaming response chunk");
        iskndr_utils::Message::Response {
            id: id.to_string(),
            status: None,
            headers: None,
            body: body.to_vec(),
            done,
        }
    };

    if let Err(e) = channel.write_json(&message).await {
        tracing::error!(request_id = %id, "failed to send response fragment: {e:?}");
    }
}

async fn send_error_fragment(
    channel: &iskndr::ClientWebSocket,
    id: &str,
    status: u16,
    description: String,
) {
    let message = iskndr_utils::Message::Response {
        id: id.to_string(),
        status: Some(status),
        headers: None,
        body: description.into_bytes(),
        done: true,
    };
    if let Err(e) = channel.write_json(&message).await {
        tracing::error!(request_id = %id, "failed to send error fragment: {e:?}");
    }
}

fn split_chunks(chunk: bytes::Bytes) -> impl Iterator<Item = bytes::Bytes> {
    let mut chunk = chunk;
    std::iter::from_fn(move || {
        if chunk.is_empty() {
            return None;
        }
        Some(chunk.split_to(chunk.len().min(CHUNK_SIZE)))
    })
}
