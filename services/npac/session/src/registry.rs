//! Registry of sessions by primary SPID.
//!
//! Populated while the adapter is configured, then read from every worker.
//! Lookups go by primary SPID, by customer SPID and by live session ID.

use crate::session::{Session, SessionError};
use npac_protocol::RegionSet;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

#[derive(Default)]
struct Inner {
    /// Sessions in registration order
    sessions: Vec<Arc<Session>>,
    /// Primary SPID -> index into `sessions`
    by_primary: HashMap<String, usize>,
    /// Customer SPID -> primary SPID
    secondaries: HashMap<String, String>,
}

/// All sessions of the adapter
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `secondary` to `primary`, creating the primary's session on first use
    pub fn add(
        &self,
        primary: &str,
        secondary: &str,
        regions: RegionSet,
    ) -> Result<Arc<Session>, SessionError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = inner.secondaries.get(secondary) {
            if existing != primary {
                return Err(SessionError::SecondaryConflict {
                    spid: secondary.to_string(),
                    primary: existing.clone(),
                });
            }
        }

        let session = match inner.by_primary.get(primary) {
            Some(index) => inner.sessions[*index].clone(),
            None => {
                let session = Arc::new(Session::new(primary));
                let index = inner.sessions.len();
                inner.sessions.push(session.clone());
                inner.by_primary.insert(primary.to_string(), index);
                info!("Created session for primary SPID {}", primary);
                session
            }
        };

        session.add_customer(secondary, regions);
        inner
            .secondaries
            .insert(secondary.to_string(), primary.to_string());
        debug!(
            "Mapped SPID {} to primary {} for regions {:?}",
            secondary, primary, regions
        );
        Ok(session)
    }

    /// Session of a primary SPID
    pub fn get(&self, primary: &str) -> Option<Arc<Session>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_primary
            .get(primary)
            .map(|index| inner.sessions[*index].clone())
    }

    /// Primary SPID serving a customer SPID
    pub fn primary_for(&self, spid: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.secondaries.get(spid).cloned().or_else(|| {
            inner
                .by_primary
                .contains_key(spid)
                .then(|| spid.to_string())
        })
    }

    /// Session serving a customer SPID (primary or secondary)
    pub fn for_customer(&self, spid: &str) -> Option<Arc<Session>> {
        self.primary_for(spid).and_then(|primary| self.get(&primary))
    }

    /// Live session carrying `session_id`
    pub fn by_session_id(&self, session_id: &str) -> Option<Arc<Session>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .sessions
            .iter()
            .find(|s| s.is_alive() && s.session_id() == session_id)
            .cloned()
    }

    /// Every session, in registration order
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .clone()
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_session_per_primary() {
        let registry = SessionRegistry::new();
        let a = registry.add("9999", "1111", RegionSet::MIDWEST).unwrap();
        let b = registry.add("9999", "2222", RegionSet::CANADA).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.primary_for("2222").as_deref(), Some("9999"));
        assert_eq!(registry.primary_for("9999").as_deref(), Some("9999"));
        assert!(registry.primary_for("3333").is_none());
    }

    #[test]
    fn test_secondary_maps_to_exactly_one_primary() {
        let registry = SessionRegistry::new();
        registry.add("9999", "1111", RegionSet::MIDWEST).unwrap();
        registry.add("9999", "1111", RegionSet::CANADA).unwrap();

        let err = registry.add("8888", "1111", RegionSet::MIDWEST).unwrap_err();
        assert_eq!(
            err,
            SessionError::SecondaryConflict {
                spid: "1111".to_string(),
                primary: "9999".to_string()
            }
        );
        assert!(registry.get("8888").is_none());
    }

    #[test]
    fn test_lookup_by_live_session_id() {
        let registry = SessionRegistry::new();
        let session = registry.add("9999", "1111", RegionSet::MIDWEST).unwrap();
        assert!(registry.by_session_id("42").is_none());

        session.set_session_id("42");
        assert!(registry.by_session_id("42").is_some());

        session.reset();
        assert!(registry.by_session_id("42").is_none());
        // the sentinel never matches
        assert!(registry.by_session_id("0").is_none());
    }
}
