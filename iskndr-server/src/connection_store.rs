use std::collections::HashMap;
use std::sync::Arc;

/// how often register retries a colliding key before giving up. with 36^8
/// possible keys a single collision is already remarkable.
const KEY_RETRY_LIMIT: usize = 5;

#[derive(Debug)]
pub enum RegisterError {
    /// The configured tunnel ceiling is reached.
    MaxTunnels,
    /// The allocator could not produce a usable key.
    KeyAllocation(eyre::Report),
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::MaxTunnels => write!(f, "maximum number of tunnels reached"),
            RegisterError::KeyAllocation(e) => {
                write!(f, "failed to allocate a subdomain key: {e}")
            }
        }
    }
}

impl std::error::Error for RegisterError {}

/// Live tunnels, keyed by their subdomain key.
///
/// register allocates the key; remove is idempotent and never touches the
/// underlying websocket, closing it is the session handler's job.
pub struct ConnectionStore<S> {
    connections: std::sync::RwLock<HashMap<String, Arc<iskndr_utils::SafeWebSocket<S>>>>,
    max_tunnels: usize,
}

impl<S> ConnectionStore<S> {
    pub fn new(max_tunnels: usize) -> Self {
        ConnectionStore {
            connections: std::sync::RwLock::new(HashMap::new()),
            max_tunnels,
        }
    }

    pub fn register(
        &self,
        channel: Arc<iskndr_utils::SafeWebSocket<S>>,
    ) -> Result<String, RegisterError> {
        let mut connections = self.connections.write().unwrap();

        if connections.len() >= self.max_tunnels {
            return Err(RegisterError::MaxTunnels);
        }

        let key = 'alloc: {
            for _ in 0..KEY_RETRY_LIMIT {
                let key =
                    iskndr_utils::generate_subdomain_key().map_err(RegisterError::KeyAllocation)?;
                if !connections.contains_key(&key) {
                    break 'alloc key;
                }
            }
            return Err(RegisterError::KeyAllocation(eyre::anyhow!(
                "every generated key collided after {KEY_RETRY_LIMIT} attempts"
            )));
        };

        connections.insert(key.clone(), channel);
        Ok(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<iskndr_utils::SafeWebSocket<S>>> {
        self.connections.read().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &str) {
        self.connections.write().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_tunnels
    }
}
