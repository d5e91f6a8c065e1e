//! Server-side parameter storage with per-session change queues.
//!
//! `ParameterStore` is the canonical name → value mapping. Every client
//! session has a queue of change events and a set of names it listens to.
//! A session listens to all cacheable parameters from the moment it syncs;
//! non-cacheable parameters are added on request.
//!
//! A session that stops draining its queue for longer than the idle timeout
//! is dropped, together with everything queued for it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::types::{
    ParameterAttributes, ParameterChange, ParameterSnapshot, ParameterValue, SessionId,
};
use crate::config::ServerConfig;
use crate::error::{LinienError, Result};

#[derive(Debug, Clone)]
struct ParameterEntry {
    value: ParameterValue,
    default: ParameterValue,
    attributes: ParameterAttributes,
}

#[derive(Debug)]
struct SessionQueue {
    listening: HashSet<String>,
    queue: Vec<ParameterChange>,
    last_seen: Instant,
}

#[derive(Debug)]
struct StoreInner {
    /// Registration order, used for the sync inventory.
    order: Vec<String>,
    parameters: HashMap<String, ParameterEntry>,
    sessions: HashMap<SessionId, SessionQueue>,
    idle_timeout: Duration,
}

/// Builder that declares the parameter inventory of a store.
#[derive(Debug)]
pub struct ParameterStoreBuilder {
    declared: Vec<(String, ParameterValue, ParameterAttributes)>,
    idle_timeout: Duration,
}

impl Default for ParameterStoreBuilder {
    fn default() -> Self {
        Self {
            declared: Vec::new(),
            idle_timeout: ServerConfig::SESSION_IDLE_TIMEOUT,
        }
    }
}

impl ParameterStoreBuilder {
    /// Declare a parameter with its default value and attributes.
    pub fn declare(
        mut self,
        name: impl Into<String>,
        default: ParameterValue,
        attributes: ParameterAttributes,
    ) -> Self {
        self.declared.push((name.into(), default, attributes));
        self
    }

    /// Drop sessions that have not fetched changes for this long.
    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Build the store. Declaring a name twice is an error.
    pub fn build(self) -> Result<ParameterStore> {
        let mut inner = StoreInner {
            order: Vec::new(),
            parameters: HashMap::new(),
            sessions: HashMap::new(),
            idle_timeout: self.idle_timeout,
        };
        for (name, default, attributes) in self.declared {
            if inner.parameters.contains_key(&name) {
                return Err(LinienError::ParameterRebind { name });
            }
            inner.order.push(name.clone());
            inner.parameters.insert(
                name,
                ParameterEntry {
                    value: default.clone(),
                    default,
                    attributes,
                },
            );
        }

        Ok(ParameterStore {
            inner: Mutex::new(inner),
        })
    }
}

/// Canonical parameter storage shared by all client sessions.
#[derive(Debug)]
pub struct ParameterStore {
    inner: Mutex<StoreInner>,
}

impl ParameterStore {
    pub fn builder() -> ParameterStoreBuilder {
        ParameterStoreBuilder::default()
    }

    /// Start (or restart) a session and return the full inventory.
    ///
    /// The session is subscribed to every cacheable parameter, so a mirror that
    /// caches never has to register those names itself.
    pub fn init_parameter_sync(&self, session: SessionId) -> Vec<ParameterSnapshot> {
        let mut inner = self.lock();
        inner.evict_idle(Instant::now());

        let listening = inner
            .parameters
            .iter()
            .filter(|(_, entry)| entry.attributes.cacheable)
            .map(|(name, _)| name.clone())
            .collect();
        inner.sessions.insert(
            session,
            SessionQueue {
                listening,
                queue: Vec::new(),
                last_seen: Instant::now(),
            },
        );

        debug!("Session {} synced {} parameters", session, inner.order.len());

        inner
            .order
            .iter()
            .filter_map(|name| {
                inner.parameters.get(name).map(|entry| ParameterSnapshot {
                    name: name.clone(),
                    value: entry.value.clone(),
                    cacheable: entry.attributes.cacheable,
                    restorable: entry.attributes.restorable,
                    loggable: entry.attributes.loggable,
                })
            })
            .collect()
    }

    /// Get the current value of a parameter.
    pub fn get(&self, name: &str) -> Result<ParameterValue> {
        self.lock()
            .parameters
            .get(name)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| unknown(name))
    }

    /// Set a parameter and queue the change for every listening session.
    pub fn set(&self, name: &str, value: ParameterValue) -> Result<()> {
        let mut inner = self.lock();
        inner.set(name, value)
    }

    /// Reset a restorable parameter to its default.
    pub fn reset(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner.parameters.get(name).ok_or_else(|| unknown(name))?;
        if !entry.attributes.restorable {
            return Err(LinienError::NotRestorable {
                name: name.to_string(),
            });
        }
        let default = entry.default.clone();
        inner.set(name, default)
    }

    /// Drain the change queue of a session. Never blocks; may be empty.
    pub fn take_changes(&self, session: SessionId) -> Result<Vec<ParameterChange>> {
        let mut inner = self.lock();
        let queue = inner.session(session)?;
        Ok(std::mem::take(&mut queue.queue))
    }

    /// Subscribe a session to additional parameters. Idempotent.
    pub fn register_listeners(&self, session: SessionId, names: &[String]) -> Result<()> {
        let mut inner = self.lock();
        if let Some(name) = names.iter().find(|n| !inner.parameters.contains_key(*n)) {
            return Err(unknown(name));
        }
        let queue = inner.session(session)?;
        queue.listening.extend(names.iter().cloned());
        debug!("Session {} now listens to {:?}", session, names);
        Ok(())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Names of all parameters in registration order.
    pub fn names(&self) -> Vec<String> {
        self.lock().order.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // Mutations never leave a half-applied entry behind, so poison is ignored.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StoreInner {
    /// Look up a live session and mark it as seen.
    fn session(&mut self, session: SessionId) -> Result<&mut SessionQueue> {
        self.evict_idle(Instant::now());
        let queue = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| LinienError::UnknownSession {
                session: session.to_string(),
            })?;
        queue.last_seen = Instant::now();
        Ok(queue)
    }

    fn evict_idle(&mut self, now: Instant) {
        let timeout = self.idle_timeout;
        self.sessions.retain(|session, queue| {
            let idle = now.saturating_duration_since(queue.last_seen);
            if idle > timeout {
                info!(
                    "Dropping session {} after {:?} idle with {} queued changes",
                    session,
                    idle,
                    queue.queue.len()
                );
                false
            } else {
                true
            }
        });
    }

    fn set(&mut self, name: &str, value: ParameterValue) -> Result<()> {
        let entry = self.parameters.get_mut(name).ok_or_else(|| unknown(name))?;
        entry.value = value.clone();
        self.evict_idle(Instant::now());

        for (session, queue) in self.sessions.iter_mut() {
            if queue.listening.contains(name) {
                trace!("Queueing {} for session {}", name, session);
                queue.queue.push(ParameterChange::new(name, value.clone()));
            }
        }
        Ok(())
    }
}

fn unknown(name: &str) -> LinienError {
    LinienError::UnknownParameter {
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ParameterStore {
        ParameterStore::builder()
            .declare(
                "speed",
                json!(10),
                ParameterAttributes::new().cacheable(true).restorable(true),
            )
            .declare("status", json!("idle"), ParameterAttributes::new())
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_declaration_is_rejected() {
        let result = ParameterStore::builder()
            .declare("speed", json!(1), ParameterAttributes::new())
            .declare("speed", json!(2), ParameterAttributes::new())
            .build();
        assert!(matches!(result, Err(LinienError::ParameterRebind { name }) if name == "speed"));
    }

    #[test]
    fn test_sync_returns_inventory_in_order() {
        let store = store();
        let inventory = store.init_parameter_sync(SessionId::new());

        let names: Vec<_> = inventory.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["speed", "status"]);
        assert!(inventory[0].cacheable);
        assert!(!inventory[1].cacheable);
        assert_eq!(inventory[1].value, json!("idle"));
    }

    #[test]
    fn test_cacheable_changes_are_queued_after_sync() {
        let store = store();
        let session = SessionId::new();
        store.init_parameter_sync(session);

        store.set("speed", json!(11)).unwrap();
        store.set("status", json!("locked")).unwrap();

        let changes = store.take_changes(session).unwrap();
        assert_eq!(changes, vec![ParameterChange::new("speed", json!(11))]);
        assert!(store.take_changes(session).unwrap().is_empty());
    }

    #[test]
    fn test_registered_listener_receives_non_cacheable_changes() {
        let store = store();
        let session = SessionId::new();
        store.init_parameter_sync(session);

        store.register_listeners(session, &["status".to_string()]).unwrap();
        store.register_listeners(session, &["status".to_string()]).unwrap();
        store.set("status", json!("locked")).unwrap();

        let changes = store.take_changes(session).unwrap();
        assert_eq!(changes, vec![ParameterChange::new("status", json!("locked"))]);
    }

    #[test]
    fn test_sessions_have_independent_queues() {
        let store = store();
        let a = SessionId::new();
        let b = SessionId::new();
        store.init_parameter_sync(a);
        store.set("speed", json!(12)).unwrap();
        store.init_parameter_sync(b);
        store.set("speed", json!(13)).unwrap();

        assert_eq!(store.take_changes(a).unwrap().len(), 2);
        assert_eq!(store.take_changes(b).unwrap().len(), 1);
    }

    #[test]
    fn test_abandoned_session_is_dropped() {
        let store = ParameterStore::builder()
            .declare("speed", json!(10), ParameterAttributes::new().cacheable(true))
            .session_idle_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let gone = SessionId::new();
        let active = SessionId::new();
        store.init_parameter_sync(gone);
        store.init_parameter_sync(active);

        for value in 0..8 {
            std::thread::sleep(Duration::from_millis(20));
            store.set("speed", json!(value)).unwrap();
            assert_eq!(store.take_changes(active).unwrap().len(), 1);
        }

        assert_eq!(store.session_count(), 1);
        assert!(matches!(
            store.take_changes(gone),
            Err(LinienError::UnknownSession { .. })
        ));
    }

    #[test]
    fn test_resync_revives_dropped_session() {
        let store = ParameterStore::builder()
            .declare("speed", json!(10), ParameterAttributes::new().cacheable(true))
            .session_idle_timeout(Duration::from_millis(10))
            .build()
            .unwrap();
        let session = SessionId::new();
        store.init_parameter_sync(session);
        std::thread::sleep(Duration::from_millis(30));
        store.set("speed", json!(11)).unwrap();
        assert_eq!(store.session_count(), 0);

        store.init_parameter_sync(session);
        store.set("speed", json!(12)).unwrap();
        assert_eq!(
            store.take_changes(session).unwrap(),
            vec![ParameterChange::new("speed", json!(12))]
        );
    }

    #[test]
    fn test_reset_restores_default_through_change_path() {
        let store = store();
        let session = SessionId::new();
        store.init_parameter_sync(session);

        store.set("speed", json!(99)).unwrap();
        store.reset("speed").unwrap();

        assert_eq!(store.get("speed").unwrap(), json!(10));
        let changes = store.take_changes(session).unwrap();
        assert_eq!(changes.last(), Some(&ParameterChange::new("speed", json!(10))));
    }

    #[test]
    fn test_reset_of_non_restorable_fails() {
        let store = store();
        assert!(matches!(
            store.reset("status"),
            Err(LinienError::NotRestorable { .. })
        ));
    }

    #[test]
    fn test_unknown_names_and_sessions() {
        let store = store();
        assert!(matches!(store.get("nope"), Err(LinienError::UnknownParameter { .. })));
        assert!(matches!(
            store.set("nope", json!(1)),
            Err(LinienError::UnknownParameter { .. })
        ));
        assert!(matches!(
            store.take_changes(SessionId::new()),
            Err(LinienError::UnknownSession { .. })
        ));

        let session = SessionId::new();
        store.init_parameter_sync(session);
        assert!(matches!(
            store.register_listeners(session, &["nope".to_string()]),
            Err(LinienError::UnknownParameter { .. })
        ));
    }
}
