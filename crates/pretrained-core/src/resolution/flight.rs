//! In-flight registry collapsing concurrent resolutions of the same key.
//!
//! The first caller to [`FlightRegistry::join`] a key becomes the leader and
//! receives a [`Publisher`]; everyone else attaches as a listener to the same
//! flight. Registration is an insert-if-absent under the registry mutex, so
//! exactly one caller leads.
//!
//! The publisher removes the registry entry *before* broadcasting the
//! terminal report over a `watch` channel; a request arriving after that
//! starts a fresh flight. When the last listener detaches before a terminal
//! report, the flight is removed and its abort token fired.

use crate::cancel::CancellationToken;
use crate::error::{PretrainedError, Result};
use crate::resolution::state::{ResolutionReport, ResolutionState};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

/// One in-flight resolution.
struct Flight {
    tx: watch::Sender<Option<ResolutionReport>>,
    /// Attached listeners. Only modified under the registry lock.
    listeners: Mutex<usize>,
    abort: CancellationToken,
}

/// Registry of in-flight resolutions keyed by `K`.
pub(crate) struct FlightRegistry<K> {
    name: &'static str,
    flights: Mutex<HashMap<K, Arc<Flight>>>,
    /// States reported before `Failed` when a leader vanishes without publishing.
    abandoned_prefix: Vec<ResolutionState>,
}

/// Result of joining a flight.
pub(crate) enum Joined<K>
where
    K: Hash + Eq + Clone + Debug,
{
    Leader(Publisher<K>, Listener<K>),
    Follower(Listener<K>),
}

impl<K> FlightRegistry<K>
where
    K: Hash + Eq + Clone + Debug,
{
    pub(crate) fn new(name: &'static str, abandoned_prefix: Vec<ResolutionState>) -> Self {
        Self {
            name,
            flights: Mutex::new(HashMap::new()),
            abandoned_prefix,
        }
    }

    /// Attach to the flight for `key`, creating it if absent.
    pub(crate) fn join(self: &Arc<Self>, key: K) -> Result<Joined<K>> {
        let mut flights = self.lock()?;

        if let Some(flight) = flights.get(&key) {
            let flight = flight.clone();
            *lock_count(&flight.listeners) += 1;
            debug!("{}: joined in-flight resolution of {:?}", self.name, key);
            let listener = Listener::new(self.clone(), key, flight);
            return Ok(Joined::Follower(listener));
        }

        let (tx, _) = watch::channel(None);
        let flight = Arc::new(Flight {
            tx,
            listeners: Mutex::new(1),
            abort: CancellationToken::new(),
        });
        flights.insert(key.clone(), flight.clone());
        drop(flights);
        debug!("{}: leading resolution of {:?}", self.name, key);

        let publisher = Publisher {
            registry: self.clone(),
            key: key.clone(),
            flight: flight.clone(),
            published: false,
        };
        let listener = Listener::new(self.clone(), key, flight);
        Ok(Joined::Leader(publisher, listener))
    }

    /// Number of flights currently registered.
    pub(crate) fn len(&self) -> usize {
        self.lock().map(|flights| flights.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<K, Arc<Flight>>>> {
        self.flights.lock().map_err(|_| {
            PretrainedError::Other(format!("{} flight registry lock poisoned", self.name))
        })
    }

    /// Remove `key` if it still maps to `flight`.
    fn remove_if_current(&self, key: &K, flight: &Arc<Flight>) {
        let mut flights = match self.flights.lock() {
            Ok(flights) => flights,
            Err(poisoned) => poisoned.into_inner(),
        };
        if flights.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            flights.remove(key);
        }
    }

    /// Detach one listener; abort the flight when none remain.
    fn detach(&self, key: &K, flight: &Arc<Flight>) {
        let mut flights = match self.flights.lock() {
            Ok(flights) => flights,
            Err(poisoned) => poisoned.into_inner(),
        };
        let remaining = {
            let mut count = lock_count(&flight.listeners);
            *count = count.saturating_sub(1);
            *count
        };
        if remaining > 0 {
            return;
        }
        if flights.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            flights.remove(key);
            drop(flights);
            debug!("{}: last listener left {:?}, aborting", self.name, key);
            flight.abort.cancel();
        }
    }

    fn abandoned_report(&self, error: PretrainedError) -> ResolutionReport {
        let mut transitions = self.abandoned_prefix.clone();
        transitions.push(ResolutionState::Failed(error.kind()));
        ResolutionReport {
            transitions,
            result: Err(error),
        }
    }
}

fn lock_count(count: &Mutex<usize>) -> MutexGuard<'_, usize> {
    match count.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Leader's handle for publishing the terminal report.
///
/// Dropping it unpublished broadcasts a failure, so listeners never hang.
pub(crate) struct Publisher<K>
where
    K: Hash + Eq + Clone + Debug,
{
    registry: Arc<FlightRegistry<K>>,
    key: K,
    flight: Arc<Flight>,
    published: bool,
}

impl<K> Publisher<K>
where
    K: Hash + Eq + Clone + Debug,
{
    /// Token fired when every listener has detached.
    pub(crate) fn abort_token(&self) -> CancellationToken {
        self.flight.abort.clone()
    }

    /// Deregister the flight, then broadcast `report` to all listeners.
    pub(crate) fn publish(mut self, report: ResolutionReport) {
        self.send(report);
    }

    fn send(&mut self, report: ResolutionReport) {
        self.registry.remove_if_current(&self.key, &self.flight);
        self.flight.tx.send_replace(Some(report));
        self.published = true;
    }
}

impl<K> Drop for Publisher<K>
where
    K: Hash + Eq + Clone + Debug,
{
    fn drop(&mut self) {
        if self.published {
            return;
        }
        let error = if self.flight.abort.is_cancelled() {
            PretrainedError::Cancelled
        } else {
            warn!("{}: leader for {:?} exited without a result", self.registry.name, self.key);
            PretrainedError::Other("resolution abandoned".to_string())
        };
        let report = self.registry.abandoned_report(error);
        self.send(report);
    }
}

/// A caller waiting for a flight's terminal report.
pub(crate) struct Listener<K>
where
    K: Hash + Eq + Clone + Debug,
{
    registry: Arc<FlightRegistry<K>>,
    key: K,
    flight: Arc<Flight>,
    rx: watch::Receiver<Option<ResolutionReport>>,
}

impl<K> Listener<K>
where
    K: Hash + Eq + Clone + Debug,
{
    fn new(registry: Arc<FlightRegistry<K>>, key: K, flight: Arc<Flight>) -> Self {
        let rx = flight.tx.subscribe();
        Self {
            registry,
            key,
            flight,
            rx,
        }
    }

    /// Wait for the terminal report.
    ///
    /// Returns `None` if `cancel` fires first; the flight itself carries on
    /// for the remaining listeners.
    pub(crate) async fn wait(mut self, cancel: Option<&CancellationToken>) -> Option<ResolutionReport> {
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);

        tokio::select! {
            report = self.rx.wait_for(|report| report.is_some()) => {
                let report = match report {
                    Ok(report) => (*report).clone(),
                    Err(_) => None,
                };
                Some(report.unwrap_or_else(|| {
                    self.registry
                        .abandoned_report(PretrainedError::Other("resolution abandoned".to_string()))
                }))
            }
            _ = cancel.cancelled() => {
                debug!("{}: caller stopped waiting for {:?}", self.registry.name, self.key);
                None
            }
        }
    }
}

impl<K> Drop for Listener<K>
where
    K: Hash + Eq + Clone + Debug,
{
    fn drop(&mut self) {
        self.registry.detach(&self.key, &self.flight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{ArtifactKey, ArtifactKind, ArtifactRecord};
    use chrono::Utc;
    use std::path::PathBuf;
    use std::time::Duration;

    fn registry() -> Arc<FlightRegistry<String>> {
        Arc::new(FlightRegistry::new("test", vec![ResolutionState::Resolving]))
    }

    fn committed_report() -> ResolutionReport {
        let now = Utc::now();
        ResolutionReport {
            transitions: vec![ResolutionState::Resolving, ResolutionState::Committed],
            result: Ok(ArtifactRecord {
                key: ArtifactKey::new("a", "en", Some("1.0.0")),
                kind: ArtifactKind::Model,
                resolved_version: "1.0.0".to_string(),
                checksum: "00".to_string(),
                local_path: PathBuf::from("/tmp/a"),
                size_bytes: 1,
                downloaded_at: now,
                last_used_at: now,
            }),
        }
    }

    fn expect_leader(joined: Joined<String>) -> (Publisher<String>, Listener<String>) {
        match joined {
            Joined::Leader(publisher, listener) => (publisher, listener),
            Joined::Follower(_) => panic!("expected leader"),
        }
    }

    fn expect_follower(joined: Joined<String>) -> Listener<String> {
        match joined {
            Joined::Follower(listener) => listener,
            Joined::Leader(..) => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn test_single_leader_and_shared_result() {
        let registry = registry();
        let (publisher, leader) = expect_leader(registry.join("k".to_string()).unwrap());
        let follower = expect_follower(registry.join("k".to_string()).unwrap());
        assert_eq!(registry.len(), 1);

        publisher.publish(committed_report());
        assert_eq!(registry.len(), 0);

        let a = leader.wait(None).await.unwrap();
        let b = follower.wait(None).await.unwrap();
        assert!(a.is_committed() && b.is_committed());
    }

    #[tokio::test]
    async fn test_join_after_publish_starts_fresh() {
        let registry = registry();
        let (publisher, listener) = expect_leader(registry.join("k".to_string()).unwrap());
        publisher.publish(committed_report());
        drop(listener);

        assert!(matches!(
            registry.join("k".to_string()).unwrap(),
            Joined::Leader(..)
        ));
    }

    #[tokio::test]
    async fn test_dropped_publisher_fails_listeners() {
        let registry = registry();
        let (publisher, listener) = expect_leader(registry.join("k".to_string()).unwrap());
        drop(publisher);

        let report = listener.wait(None).await.unwrap();
        assert_eq!(
            report.result.as_ref().err().map(|e| e.kind()),
            Some(ErrorKind::Internal)
        );
        assert_eq!(
            report.transitions,
            vec![
                ResolutionState::Resolving,
                ResolutionState::Failed(ErrorKind::Internal)
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_listener_does_not_abort_others() {
        let registry = registry();
        let (publisher, leader) = expect_leader(registry.join("k".to_string()).unwrap());
        let follower = expect_follower(registry.join("k".to_string()).unwrap());
        let abort = publisher.abort_token();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(follower.wait(Some(&cancel)).await.is_none());
        assert!(!abort.is_cancelled());
        assert_eq!(registry.len(), 1);

        publisher.publish(committed_report());
        assert!(leader.wait(None).await.unwrap().is_committed());
    }

    #[tokio::test]
    async fn test_last_listener_leaving_aborts_flight() {
        let registry = registry();
        let (publisher, leader) = expect_leader(registry.join("k".to_string()).unwrap());
        let abort = publisher.abort_token();

        drop(leader);
        assert!(abort.is_cancelled());
        assert_eq!(registry.len(), 0);

        // A new caller is not attached to the aborted flight.
        assert!(matches!(
            registry.join("k".to_string()).unwrap(),
            Joined::Leader(..)
        ));
        drop(publisher);
    }

    #[tokio::test]
    async fn test_listener_waits_for_late_publish() {
        let registry = registry();
        let (publisher, listener) = expect_leader(registry.join("k".to_string()).unwrap());

        let waiter = tokio::spawn(async move { listener.wait(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(committed_report());

        assert!(waiter.await.unwrap().unwrap().is_committed());
    }
}
