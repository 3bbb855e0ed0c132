//! Association event notification.

use npac_session::{AssociationEvent, AssociationListener, AssociationState, ListenerId, Session};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Logs association transitions and optionally fans them out on a channel
#[derive(Debug)]
pub struct AssociationEventNotifier {
    event_tx: Option<mpsc::UnboundedSender<AssociationEvent>>,
    sequence_counter: AtomicU64,
}

impl AssociationEventNotifier {
    /// Notifier that only logs
    pub fn logging() -> Self {
        Self {
            event_tx: None,
            sequence_counter: AtomicU64::new(1),
        }
    }

    /// Notifier that forwards every event to the returned receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AssociationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                event_tx: Some(event_tx),
                sequence_counter: AtomicU64::new(1),
            },
            event_rx,
        )
    }

    /// Events seen so far
    pub fn events_seen(&self) -> u64 {
        self.sequence_counter.load(Ordering::SeqCst) - 1
    }
}

/// Association transitions of a set of sessions.
///
/// Dropping the stream unsubscribes it from every session.
#[derive(Debug)]
pub struct AssociationEvents {
    event_rx: mpsc::UnboundedReceiver<AssociationEvent>,
    subscriptions: Vec<(Arc<Session>, ListenerId)>,
}

impl AssociationEvents {
    /// Subscribe one channel notifier to each of `sessions`
    pub fn subscribe<'a>(sessions: impl IntoIterator<Item = &'a Arc<Session>>) -> Self {
        let (notifier, event_rx) = AssociationEventNotifier::channel();
        let notifier = Arc::new(notifier);
        let subscriptions = sessions
            .into_iter()
            .map(|session| (session.clone(), session.subscribe(notifier.clone())))
            .collect();
        Self {
            event_rx,
            subscriptions,
        }
    }

    /// Next transition; `None` once every session is gone
    pub async fn recv(&mut self) -> Option<AssociationEvent> {
        self.event_rx.recv().await
    }

    /// Next transition if one is already queued
    pub fn try_recv(&mut self) -> Option<AssociationEvent> {
        self.event_rx.try_recv().ok()
    }
}

impl Drop for AssociationEvents {
    fn drop(&mut self) {
        for (session, id) in self.subscriptions.drain(..) {
            session.unsubscribe(id);
        }
    }
}

impl AssociationListener for AssociationEventNotifier {
    fn association_changed(&self, event: &AssociationEvent) {
        let sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);

        match &self.event_tx {
            Some(event_tx) => {
                if event_tx.send(event.clone()).is_err() {
                    debug!("Association event {} dropped: receiver closed", sequence);
                }
            }
            None => match event.current {
                AssociationState::Connected => info!(
                    "Association {} region {} ({}) connected",
                    event.primary_spid,
                    event.region,
                    event.region.label()
                ),
                AssociationState::Retry => warn!(
                    "Association {} region {} ({}) {} -> RETRY",
                    event.primary_spid,
                    event.region,
                    event.region.label(),
                    event.previous
                ),
                AssociationState::Down if event.previous != AssociationState::Down => {
                    warn!(
                        "Association {} region {} ({}) went down from {}",
                        event.primary_spid,
                        event.region,
                        event.region.label(),
                        event.previous
                    )
                }
                current => debug!(
                    "Association {} region {}: {} -> {} (generation {})",
                    event.primary_spid, event.region, event.previous, current, event.generation
                ),
            },
        }
        if event.previous == AssociationState::Connected && event.current == AssociationState::Retry {
            error!(
                "Connected association {} region {} lost",
                event.primary_spid, event.region
            );
        }
    }
}
