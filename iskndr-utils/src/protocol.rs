use std::collections::HashMap;

/// the control protocol
/// ====================
///
/// everything that crosses a tunnel is a JSON text message over the
/// websocket. the first message is special: right after the upgrade the
/// server sends a [RegisterTunnelMessage] carrying the public URL it
/// assigned to the tunnel. from then on both sides speak [Message], a
/// single union tagged by `type`.
///
/// a `request` message carries one complete public HTTP request: id,
/// method, path (with query), flattened headers and the whole body. the
/// client answers with one or more `response` messages for the same id.
/// the first response fragment carries the status and headers; every
/// fragment carries body bytes (possibly none); the last one carries
/// `done = true`. fragments for different ids interleave freely on the
/// shared channel, which is the whole point: one websocket serves every
/// in-flight request of a tunnel.
///
/// body bytes travel as base64 strings, the standard JSON rendering of a
/// raw byte payload.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, with = "base64_bytes")]
        body: Vec<u8>,
    },
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(default, with = "base64_bytes")]
        body: Vec<u8>,
        #[serde(default)]
        done: bool,
    },
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::Request { id, .. } => id,
            Message::Response { id, .. } => id,
        }
    }
}

/// Sent by the server exactly once after the control upgrade. `subdomain`
/// is the full public URL assigned to the tunnel.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegisterTunnelMessage {
    pub subdomain: String,
}

/// Flattens a header map to one string value per name, multiple values
/// joined with ", ". Values that are not valid UTF-8 are skipped.
pub fn flatten_headers(headers: &hyper::HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        flat.insert(name.as_str().to_string(), joined);
    }
    flat
}

mod base64_bytes {
    use base64::Engine;

    pub fn serialize<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        use serde::Deserialize;

        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Message, flatten_headers};

    #[test]
    fn request_wire_shape() {
        let msg = Message::Request {
            id: "req-1".to_string(),
            method: "GET".to_string(),
            path: "/hello?x=1".to_string(),
            headers: [("accept".to_string(), "*/*".to_string())].into(),
            body: b"hi".to_vec(),
        };

        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains(r#""type":"request""#));
        assert!(encoded.contains(r#""body":"aGk=""#));

        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn response_fragment_without_status_round_trips() {
        let msg = Message::Response {
            id: "req-1".to_string(),
            status: None,
            headers: None,
            body: vec![0, 159, 146, 150],
            done: true,
        };

        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(!encoded.contains("status"));
        assert!(encoded.contains(r#""done":true"#));

        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn response_with_null_body_decodes_as_empty() {
        let decoded: Message =
            serde_json::from_str(r#"{"type":"response","id":"r","body":null,"done":false}"#)
                .unwrap();
        match decoded {
            Message::Response { body, done, .. } => {
                assert!(body.is_empty());
                assert!(!done);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn multi_value_headers_are_comma_joined() {
        let mut headers = hyper::HeaderMap::new();
        headers.append("accept-encoding", "gzip".parse().unwrap());
        headers.append("accept-encoding", "br".parse().unwrap());
        headers.insert("host", "a.example.com".parse().unwrap());

        let flat = flatten_headers(&headers);
        assert_eq!(flat.get("accept-encoding").unwrap(), "gzip, br");
        assert_eq!(flat.get("host").unwrap(), "a.example.com");
    }
}
