use std::collections::HashMap;

/// fragments a mailbox buffers before its producer, the session read
/// loop, is back-pressured by a slow public consumer.
pub const MAILBOX_CAPACITY: usize = 5;

/// The consuming end of one request's mailbox.
pub type Mailbox = tokio::sync::mpsc::Receiver<iskndr_utils::Message>;

#[derive(Debug, Clone)]
pub struct MaxRequestsError {
    pub max_per_tunnel: usize,
}

impl std::fmt::Display for MaxRequestsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "maximum number of concurrent requests per tunnel reached ({})",
            self.max_per_tunnel
        )
    }
}

impl std::error::Error for MaxRequestsError {}

struct MailboxEntry {
    sender: tokio::sync::mpsc::Sender<iskndr_utils::Message>,
    subdomain: String,
}

#[derive(Default)]
struct Inner {
    mailboxes: HashMap<String, MailboxEntry>,
    active: HashMap<String, usize>,
}

/// In-flight public requests: one mailbox per request id, and an active
/// count per subdomain capped by the configured ceiling.
///
/// a mailbox is closed by removing its entry, which drops the only held
/// `Sender`; the consumer then drains whatever was buffered and observes
/// the end of the sequence. fragments looked up after removal are simply
/// dropped by the producer.
pub struct RequestManager {
    inner: std::sync::RwLock<Inner>,
    max_per_tunnel: usize,
}

impl RequestManager {
    pub fn new(max_per_tunnel: usize) -> Self {
        RequestManager {
            inner: std::sync::RwLock::new(Inner::default()),
            max_per_tunnel,
        }
    }

    pub fn register(&self, request_id: &str, subdomain: &str) -> Result<Mailbox, MaxRequestsError> {
        let mut inner = self.inner.write().unwrap();

        let active = inner.active.get(subdomain).copied().unwrap_or(0);
        if active >= self.max_per_tunnel {
            return Err(MaxRequestsError {
                max_per_tunnel: self.max_per_tunnel,
            });
        }

        let (sender, receiver) = tokio::sync::mpsc::channel(MAILBOX_CAPACITY);
        inner.mailboxes.insert(
            request_id.to_string(),
            MailboxEntry {
                sender,
                subdomain: subdomain.to_string(),
            },
        );
        *inner.active.entry(subdomain.to_string()).or_insert(0) += 1;

        Ok(receiver)
    }

    /// Clones the sender out so no caller ever holds the lock across a
    /// send (which can block on a full mailbox).
    pub fn lookup(
        &self,
        request_id: &str,
    ) -> Option<tokio::sync::mpsc::Sender<iskndr_utils::Message>> {
        self.inner
            .read()
            .unwrap()
            .mailboxes
            .get(request_id)
            .map(|entry| entry.sender.clone())
    }

    /// Closes the mailbox (no-op if absent) and releases its slot.
    pub fn remove(&self, request_id: &str, subdomain: &str) {
        let mut inner = self.inner.write().unwrap();
        if inner.mailboxes.remove(request_id).is_some() {
            decrement(&mut inner.active, subdomain);
        }
    }

    /// Closes every mailbox belonging to `subdomain`. Called when a tunnel
    /// session dies so waiting handlers fail fast instead of timing out.
    pub fn remove_subdomain(&self, subdomain: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.mailboxes.retain(|_, entry| entry.subdomain != subdomain);
        inner.active.remove(subdomain);
    }

    pub fn active_count(&self, subdomain: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .active
            .get(subdomain)
            .copied()
            .unwrap_or(0)
    }
}

fn decrement(active: &mut HashMap<String, usize>, subdomain: &str) {
    if let Some(count) = active.get_mut(subdomain) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            active.remove(subdomain);
        }
    }
}
