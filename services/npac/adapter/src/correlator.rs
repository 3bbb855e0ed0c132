//! Invoke-ID correlation of outstanding requests.
//!
//! Every request the adapter expects an answer for is registered here before it
//! is handed to the transport. A reply, an error or the resend timer then
//! claims the entry; whichever gets there first wins and the others find
//! nothing. Expired entries are delivered on a channel so the owner can run
//! their timeout path on its own workers.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use npac_protocol::InvokeId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A registration whose timer fired before any reply arrived
#[derive(Debug)]
pub struct Expired<H> {
    /// Invoke ID of the request
    pub invoke_id: InvokeId,
    /// Handler that was waiting for it
    pub handler: H,
}

struct Waiting<H> {
    handler: H,
    timer: Option<JoinHandle<()>>,
}

/// Outstanding requests keyed by invoke ID
pub struct ReplyCorrelator<H> {
    entries: Arc<DashMap<InvokeId, Waiting<H>>>,
    expired_tx: mpsc::UnboundedSender<Expired<H>>,
}

impl<H> ReplyCorrelator<H>
where
    H: Send + Sync + 'static,
{
    /// Create a correlator and the channel its expired entries arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Expired<H>>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: Arc::new(DashMap::new()),
                expired_tx,
            },
            expired_rx,
        )
    }

    /// Register `handler` for `invoke_id` and arm its timer.
    ///
    /// Returns false, leaving the existing registration in place, if the invoke
    /// ID is already outstanding.
    pub fn add(&self, invoke_id: InvokeId, handler: H, timeout: Duration) -> bool {
        match self.entries.entry(invoke_id.clone()) {
            Entry::Occupied(_) => {
                error!("Invoke ID {} is already awaiting a reply", invoke_id);
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(Waiting {
                    handler,
                    timer: None,
                });
            }
        }

        let entries = Arc::clone(&self.entries);
        let expired_tx = self.expired_tx.clone();
        let id = invoke_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((invoke_id, waiting)) = entries.remove(&id) {
                debug!("No reply for invoke ID {} within {:?}", invoke_id, timeout);
                let expired = Expired {
                    invoke_id,
                    handler: waiting.handler,
                };
                if expired_tx.send(expired).is_err() {
                    warn!("Timeout for invoke ID {} dropped: correlator closed", id);
                }
            }
        });

        match self.entries.get_mut(&invoke_id) {
            Some(mut waiting) => waiting.timer = Some(timer),
            // claimed between insert and here
            None => timer.abort(),
        }
        true
    }

    /// Claim the registration for `invoke_id`, disarming its timer
    pub fn remove(&self, invoke_id: &InvokeId) -> Option<H> {
        let (_, waiting) = self.entries.remove(invoke_id)?;
        if let Some(timer) = waiting.timer {
            timer.abort();
        }
        Some(waiting.handler)
    }

    /// Drop a registration after a failed send
    pub fn cancel(&self, invoke_id: &InvokeId) -> Option<H> {
        let handler = self.remove(invoke_id);
        if handler.is_some() {
            debug!("Cancelled reply registration for invoke ID {}", invoke_id);
        }
        handler
    }

    /// Whether a reply for `invoke_id` is awaited
    pub fn exists(&self, invoke_id: &InvokeId) -> bool {
        self.entries.contains_key(invoke_id)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every registration without running any handler
    pub fn clear(&self) -> usize {
        let ids: Vec<InvokeId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.remove(id).is_some()).count()
    }
}

impl<H> fmt::Debug for ReplyCorrelator<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyCorrelator")
            .field("outstanding", &self.entries.len())
            .finish()
    }
}
