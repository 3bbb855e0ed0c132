//! Per-primary-customer session state.
//!
//! A [`Session`] owns the gateway session ID, one association slot per region,
//! the keep-alive counters and the list of customer SPIDs it serves. Each region
//! slot sits behind its own lock so transitions on one region never wait on
//! another, and every transition is published to the registered listeners.

use crate::association::{AssociationEvent, AssociationListener, AssociationState, ListenerId};
use crate::keepalive::KeepAliveCounters;
use npac_protocol::{Ack, Region, RegionSet, REGION_COUNT, UNINITIALIZED_SESSION_ID};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info};

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A guarded transition found the region in another state
    #[error("region {region} is {actual}, expected one of {expected:?}")]
    UnexpectedState {
        /// Region
        region: Region,
        /// Accepted source states
        expected: Vec<AssociationState>,
        /// State found
        actual: AssociationState,
    },
    /// Secondary SPID already served by another primary
    #[error("SPID {spid} already belongs to primary {primary}")]
    SecondaryConflict {
        /// Secondary SPID
        spid: String,
        /// Primary it is mapped to
        primary: String,
    },
}

/// A customer SPID served by a session and the regions it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondarySpid {
    /// Customer SPID
    pub spid: String,
    /// Regions it needs
    pub regions: RegionSet,
}

#[derive(Debug, Default)]
struct OpenAttempt {
    attempt: u64,
    in_flight: bool,
}

#[derive(Debug, Default)]
struct RegionSlot {
    state: AssociationState,
    generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// State of one primary SPID's gateway session
pub struct Session {
    primary_spid: String,
    session_id: RwLock<String>,
    open: Mutex<OpenAttempt>,
    regions: [Mutex<RegionSlot>; REGION_COUNT],
    keep_alive: Mutex<KeepAliveCounters>,
    customers: RwLock<Vec<SecondarySpid>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn AssociationListener>)>>,
    next_listener_id: AtomicU64,
}

impl Session {
    /// New session, never connected
    pub fn new(primary_spid: impl Into<String>) -> Self {
        Self {
            primary_spid: primary_spid.into(),
            session_id: RwLock::new(UNINITIALIZED_SESSION_ID.to_string()),
            open: Mutex::new(OpenAttempt::default()),
            regions: std::array::from_fn(|_| Mutex::new(RegionSlot::default())),
            keep_alive: Mutex::new(KeepAliveCounters::new()),
            customers: RwLock::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Primary SPID
    pub fn primary_spid(&self) -> &str {
        &self.primary_spid
    }

    /// Current session ID (the sentinel while not alive)
    pub fn session_id(&self) -> String {
        read(&self.session_id).clone()
    }

    /// Store the session ID assigned by the peer
    pub fn set_session_id(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        info!(
            "Session for primary SPID {} assigned ID {}",
            self.primary_spid, session_id
        );
        *write(&self.session_id) = session_id;
    }

    /// Whether the peer has assigned a session ID
    pub fn is_alive(&self) -> bool {
        *read(&self.session_id) != UNINITIALIZED_SESSION_ID
    }

    /// Start a NewSession attempt.
    ///
    /// Returns `None` while the session is alive or another attempt is still
    /// outstanding; at most one attempt is in flight at a time.
    pub fn begin_open(&self) -> Option<u64> {
        if self.is_alive() {
            return None;
        }
        let mut open = lock(&self.open);
        if open.in_flight {
            return None;
        }
        open.attempt += 1;
        open.in_flight = true;
        Some(open.attempt)
    }

    /// End attempt `attempt`; false when it was superseded by a reset
    pub fn finish_open(&self, attempt: u64) -> bool {
        let mut open = lock(&self.open);
        if open.in_flight && open.attempt == attempt {
            open.in_flight = false;
            true
        } else {
            false
        }
    }

    /// Serve `spid` in `regions`; repeated registrations widen the region set
    pub fn add_customer(&self, spid: &str, regions: RegionSet) {
        let mut customers = write(&self.customers);
        match customers.iter_mut().find(|c| c.spid == spid) {
            Some(existing) => existing.regions |= regions,
            None => customers.push(SecondarySpid {
                spid: spid.to_string(),
                regions,
            }),
        }
    }

    /// Customer SPIDs in registration order
    pub fn customers(&self) -> Vec<SecondarySpid> {
        read(&self.customers).clone()
    }

    /// SPIDs that need `region`, in registration order
    pub fn spids_for_region(&self, region: Region) -> Vec<String> {
        read(&self.customers)
            .iter()
            .filter(|c| c.regions.supports(region))
            .map(|c| c.spid.clone())
            .collect()
    }

    /// Current association state of `region`
    pub fn association_state(&self, region: Region) -> AssociationState {
        lock(&self.regions[region.index()]).state
    }

    /// Transition counter of `region`; changes on every state change
    pub fn generation(&self, region: Region) -> u64 {
        lock(&self.regions[region.index()]).generation
    }

    /// Whether `region` is in `state`
    pub fn is_association(&self, region: Region, state: AssociationState) -> bool {
        self.association_state(region) == state
    }

    /// Set the state of `region` unconditionally
    pub fn set_association_state(
        &self,
        region: Region,
        state: AssociationState,
    ) -> AssociationEvent {
        let event = {
            let mut slot = lock(&self.regions[region.index()]);
            self.apply(region, &mut slot, state)
        };
        self.publish(&event);
        event
    }

    /// Set the state of `region` only if it is currently one of `from`
    pub fn transition(
        &self,
        region: Region,
        from: &[AssociationState],
        to: AssociationState,
    ) -> Result<AssociationEvent, SessionError> {
        let event = {
            let mut slot = lock(&self.regions[region.index()]);
            if !from.contains(&slot.state) {
                return Err(SessionError::UnexpectedState {
                    region,
                    expected: from.to_vec(),
                    actual: slot.state,
                });
            }
            self.apply(region, &mut slot, to)
        };
        self.publish(&event);
        Ok(event)
    }

    fn apply(
        &self,
        region: Region,
        slot: &mut RegionSlot,
        state: AssociationState,
    ) -> AssociationEvent {
        let previous = slot.state;
        slot.state = state;
        slot.generation += 1;
        debug!(
            "Session {} region {} ({}): {} -> {}",
            self.primary_spid,
            region,
            region.label(),
            previous,
            state
        );
        AssociationEvent {
            primary_spid: self.primary_spid.clone(),
            region,
            previous,
            current: state,
            generation: slot.generation,
        }
    }

    fn publish(&self, event: &AssociationEvent) {
        let listeners: Vec<Arc<dyn AssociationListener>> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.association_changed(event);
        }
    }

    /// Register an association listener
    pub fn subscribe(&self, listener: Arc<dyn AssociationListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.listeners).push((id, listener));
        id
    }

    /// Remove a listener; unknown IDs are ignored
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Take the next outbound keep-alive sequence number
    pub fn next_keep_alive_sequence(&self) -> u64 {
        lock(&self.keep_alive).next_outbound()
    }

    /// Check an inbound keep-alive sequence number
    pub fn keep_alive_received(&self, sequence: u64) -> Ack {
        let mut counters = lock(&self.keep_alive);
        let expected = counters.expected_inbound();
        let ack = counters.receive(sequence);
        if !ack.is_ack() {
            debug!(
                "Session {} keep-alive sequence {} does not match expected {}",
                self.primary_spid, sequence, expected
            );
        }
        ack
    }

    /// Sequence number the peer must send next
    pub fn expected_keep_alive_sequence(&self) -> u64 {
        lock(&self.keep_alive).expected_inbound()
    }

    /// Forget the session: sentinel ID, counters at 1, every region DOWN.
    ///
    /// An outstanding NewSession attempt is abandoned.
    pub fn reset(&self) {
        info!("Resetting session for primary SPID {}", self.primary_spid);
        *write(&self.session_id) = UNINITIALIZED_SESSION_ID.to_string();
        {
            let mut open = lock(&self.open);
            open.attempt += 1;
            open.in_flight = false;
        }
        lock(&self.keep_alive).reset();
        for region in Region::all() {
            self.set_association_state(region, AssociationState::Down);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("primary_spid", &self.primary_spid)
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Primary SPID [{}] Session ID [{}]",
            self.primary_spid,
            self.session_id()
        )?;
        for region in Region::all() {
            write!(
                f,
                " {} [{}]",
                region.label(),
                self.association_state(region)
            )?;
        }
        Ok(())
    }
}
