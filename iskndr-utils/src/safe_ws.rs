use futures_util::stream::{SplitSink, SplitStream};

type WsMessage = tokio_tungstenite::tungstenite::Message;

/// A websocket shared by many writers.
///
/// every in-flight request of a tunnel produces fragments on the same
/// connection, so writes have to be serialized: the mutex around the sink
/// guarantees each JSON message goes out as one whole websocket frame,
/// never interleaved with another writer's frame. reads are not shared,
/// the owning session loop is the only caller by convention, and the
/// separate read mutex exists so the loop and a shutdown path never race.
pub struct SafeWebSocket<S> {
    write: tokio::sync::Mutex<SplitSink<tokio_tungstenite::WebSocketStream<S>, WsMessage>>,
    read: tokio::sync::Mutex<SplitStream<tokio_tungstenite::WebSocketStream<S>>>,
}

impl<S> SafeWebSocket<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new(ws: tokio_tungstenite::WebSocketStream<S>) -> Self {
        use futures_util::StreamExt;

        let (write, read) = ws.split();
        SafeWebSocket {
            write: tokio::sync::Mutex::new(write),
            read: tokio::sync::Mutex::new(read),
        }
    }

    /// Serializes `msg` and sends it as a single text message. Blocks on
    /// the write lock while another producer is mid-message.
    pub async fn write_json<T: serde::Serialize>(&self, msg: &T) -> eyre::Result<()> {
        use futures_util::SinkExt;

        let encoded = serde_json::to_string(msg)?;
        let mut write = self.write.lock().await;
        write
            .send(WsMessage::Text(encoded.into()))
            .await
            .map_err(|e| eyre::anyhow!("websocket write failed: {e}"))
    }

    /// Reads the next data message and decodes it. Control frames are
    /// skipped; a close frame or a dropped connection is an error.
    pub async fn read_json<T: serde::de::DeserializeOwned>(&self) -> eyre::Result<T> {
        use futures_util::StreamExt;

        let mut read = self.read.lock().await;
        loop {
            return match read.next().await {
                Some(Ok(WsMessage::Text(text))) => serde_json::from_str(text.as_str())
                    .map_err(|e| eyre::anyhow!("invalid control message: {e}")),
                Some(Ok(WsMessage::Binary(data))) => serde_json::from_slice(&data)
                    .map_err(|e| eyre::anyhow!("invalid control message: {e}")),
                Some(Ok(WsMessage::Close(_))) | None => {
                    Err(eyre::anyhow!("websocket connection closed"))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => Err(eyre::anyhow!("websocket read failed: {e}")),
            };
        }
    }

    /// Initiates the close handshake. Safe to call more than once.
    pub async fn close(&self) {
        use futures_util::SinkExt;

        let mut write = self.write.lock().await;
        if let Err(e) = write.close().await {
            tracing::debug!("websocket close: {e}");
        }
    }
}
