use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use consmon_db::Store;
use tracing::{debug, error, info, warn};

use crate::{
    CONSOLE_PORT_TABLE, CONTROL_TICK, HEARTBEAT_TIMEOUT, LAST_HEARTBEAT_FIELD, OPER_STATE_FIELD,
};

/// Seconds since the Unix epoch; the timestamp format of `last_heartbeat`.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sink for per-link operational state.
///
/// The proxy and ticker threads publish through this seam; production
/// wires in [`StoreStatePublisher`], tests record calls.
pub trait StatePublisher: Send + Sync {
    /// The link saw a heartbeat at `last_heartbeat` (epoch seconds).
    fn link_up(&self, link_id: &str, last_heartbeat: u64);
    /// The link's heartbeat deadline passed (or its proxy died).
    fn link_down(&self, link_id: &str);
    /// The link's configuration is gone; remove our fields, leaving any
    /// foreign fields at the key untouched.
    fn clear_link(&self, link_id: &str);
}

/// Publishes liveness into the state store under `CONSOLE_PORT|<id>`.
///
/// Store failures are logged and swallowed: losing one publication must
/// not take down the RX pipeline, and the next heartbeat or tick repeats
/// the write anyway.
pub struct StoreStatePublisher {
    store: Mutex<Store>,
}

impl StoreStatePublisher {
    pub fn new(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }
}

impl StatePublisher for StoreStatePublisher {
    fn link_up(&self, link_id: &str, last_heartbeat: u64) {
        let mut store = match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let fields = [
            (OPER_STATE_FIELD, "up".to_string()),
            (LAST_HEARTBEAT_FIELD, last_heartbeat.to_string()),
        ];
        if let Err(err) = store.hset(CONSOLE_PORT_TABLE, link_id, &fields) {
            error!(link = link_id, %err, "failed to publish oper_state=up");
        }
    }

    fn link_down(&self, link_id: &str) {
        let mut store = match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let fields = [(OPER_STATE_FIELD, "down".to_string())];
        if let Err(err) = store.hset(CONSOLE_PORT_TABLE, link_id, &fields) {
            error!(link = link_id, %err, "failed to publish oper_state=down");
        }
    }

    fn clear_link(&self, link_id: &str) {
        let mut store = match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let fields = [OPER_STATE_FIELD, LAST_HEARTBEAT_FIELD];
        if let Err(err) = store.hdel(CONSOLE_PORT_TABLE, link_id, &fields) {
            error!(link = link_id, %err, "failed to clear link state");
        }
    }
}

struct Inner {
    up: bool,
    last_heartbeat: Option<u64>,
}

/// Per-link liveness: `oper_state` plus the heartbeat deadline.
///
/// Heartbeat updates (proxy RX thread) and expiry checks (ticker thread)
/// serialize on one mutex, and expiry re-checks staleness inside the
/// lock, so a `down` can never overwrite a strictly newer `up`.
pub struct Liveness {
    link_id: String,
    inner: Mutex<Inner>,
    publisher: Arc<dyn StatePublisher>,
}

impl Liveness {
    /// Create in the `down` state and publish it. No `last_heartbeat` is
    /// written until evidence arrives: the system never assumes `up`.
    pub fn new(link_id: impl Into<String>, publisher: Arc<dyn StatePublisher>) -> Self {
        let link_id = link_id.into();
        publisher.link_down(&link_id);
        Self {
            link_id,
            inner: Mutex::new(Inner {
                up: false,
                last_heartbeat: None,
            }),
            publisher,
        }
    }

    /// A heartbeat decoded at `now`. Idempotently republishes `up` with
    /// the fresh timestamp.
    pub fn heartbeat(&self, now: u64) {
        let mut inner = self.lock();
        let was_up = inner.up;
        inner.up = true;
        inner.last_heartbeat = Some(now);
        drop(inner);

        if !was_up {
            info!(link = %self.link_id, "link up");
        }
        self.publisher.link_up(&self.link_id, now);
    }

    /// Ticker check: demote to `down` once the deadline has passed.
    /// `last_heartbeat` keeps its value so operators can see how stale the
    /// link is.
    pub fn expire(&self, now: u64) {
        let mut inner = self.lock();
        let stale = match (inner.up, inner.last_heartbeat) {
            (true, Some(last)) => now >= last + HEARTBEAT_TIMEOUT.as_secs(),
            _ => false,
        };
        if !stale {
            return;
        }
        inner.up = false;
        drop(inner);

        warn!(link = %self.link_id, "heartbeat timeout, link down");
        self.publisher.link_down(&self.link_id);
    }

    /// The proxy died (device gone); force `down` regardless of deadline.
    pub fn mark_down(&self) {
        let mut inner = self.lock();
        let was_up = inner.up;
        inner.up = false;
        drop(inner);

        if was_up {
            warn!(link = %self.link_id, "link down");
        }
        self.publisher.link_down(&self.link_id);
    }

    pub fn is_up(&self) -> bool {
        self.lock().up
    }

    pub fn last_heartbeat(&self) -> Option<u64> {
        self.lock().last_heartbeat
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The set of live links shared between the supervisor (insert/remove)
/// and the single ticker thread (expiry).
#[derive(Clone, Default)]
pub struct LivenessRegistry {
    links: Arc<Mutex<HashMap<String, Arc<Liveness>>>>,
}

impl LivenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, liveness: Arc<Liveness>) {
        self.lock().insert(liveness.link_id().to_string(), liveness);
    }

    pub fn remove(&self, link_id: &str) {
        self.lock().remove(link_id);
    }

    /// Run one expiry pass over all links.
    pub fn tick(&self, now: u64) {
        let links: Vec<Arc<Liveness>> = self.lock().values().cloned().collect();
        for link in links {
            link.expire(now);
        }
    }

    /// Spawn the once-per-second expiry thread.
    pub fn spawn_ticker(&self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        let registry = self.clone();
        std::thread::Builder::new()
            .name("consmon-ticker".to_string())
            .spawn(move || {
                debug!("liveness ticker started");
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(CONTROL_TICK);
                    registry.tick(epoch_secs());
                }
                debug!("liveness ticker stopped");
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Liveness>>> {
        match self.links.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Published {
        Up(String, u64),
        Down(String),
        Clear(String),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Published>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Published> {
            self.events.lock().unwrap().clone()
        }
    }

    impl StatePublisher for Recorder {
        fn link_up(&self, link_id: &str, last_heartbeat: u64) {
            self.events
                .lock()
                .unwrap()
                .push(Published::Up(link_id.to_string(), last_heartbeat));
        }

        fn link_down(&self, link_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push(Published::Down(link_id.to_string()));
        }

        fn clear_link(&self, link_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push(Published::Clear(link_id.to_string()));
        }
    }

    #[test]
    fn starts_down_without_heartbeat_timestamp() {
        let recorder = Arc::new(Recorder::default());
        let live = Liveness::new("link1", recorder.clone());

        assert!(!live.is_up());
        assert_eq!(live.last_heartbeat(), None);
        assert_eq!(recorder.events(), vec![Published::Down("link1".into())]);
    }

    #[test]
    fn heartbeat_brings_link_up_and_publishes_timestamp() {
        let recorder = Arc::new(Recorder::default());
        let live = Liveness::new("link1", recorder.clone());

        live.heartbeat(1000);
        assert!(live.is_up());
        assert_eq!(live.last_heartbeat(), Some(1000));
        assert_eq!(
            recorder.events(),
            vec![
                Published::Down("link1".into()),
                Published::Up("link1".into(), 1000),
            ]
        );
    }

    #[test]
    fn stays_up_inside_the_window_and_expires_after() {
        let recorder = Arc::new(Recorder::default());
        let live = Liveness::new("link1", recorder.clone());

        live.heartbeat(1000);
        live.expire(1014);
        assert!(live.is_up(), "14 s after a heartbeat the link is still up");

        live.expire(1016);
        assert!(!live.is_up(), "16 s after a heartbeat the link is down");
        assert_eq!(
            live.last_heartbeat(),
            Some(1000),
            "last_heartbeat must survive the down transition"
        );
        assert_eq!(
            recorder.events().last(),
            Some(&Published::Down("link1".into()))
        );
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let recorder = Arc::new(Recorder::default());
        let live = Liveness::new("link1", recorder);
        live.heartbeat(1000);
        live.expire(1015);
        assert!(!live.is_up());
    }

    #[test]
    fn fresh_heartbeat_prevents_demotion() {
        // The ticker races the RX thread: a heartbeat taken between the
        // ticker reading the clock and acquiring the lock must win.
        let recorder = Arc::new(Recorder::default());
        let live = Liveness::new("link1", recorder.clone());

        live.heartbeat(1000);
        live.heartbeat(1020);
        live.expire(1016); // stale "now" from before the second heartbeat
        assert!(live.is_up(), "a newer up must not be demoted");
    }

    #[test]
    fn expire_without_heartbeat_does_not_republish_down() {
        let recorder = Arc::new(Recorder::default());
        let live = Liveness::new("link1", recorder.clone());

        live.expire(5000);
        live.expire(6000);
        assert_eq!(
            recorder.events(),
            vec![Published::Down("link1".into())],
            "only the initial down is published"
        );
    }

    #[test]
    fn heartbeat_republishes_every_time() {
        let recorder = Arc::new(Recorder::default());
        let live = Liveness::new("link1", recorder.clone());

        live.heartbeat(1000);
        live.heartbeat(1005);
        live.heartbeat(1010);
        let ups = recorder
            .events()
            .iter()
            .filter(|e| matches!(e, Published::Up(..)))
            .count();
        assert_eq!(ups, 3);
    }

    #[test]
    fn registry_tick_expires_all_links() {
        let recorder = Arc::new(Recorder::default());
        let registry = LivenessRegistry::new();

        let a = Arc::new(Liveness::new("a", recorder.clone()));
        let b = Arc::new(Liveness::new("b", recorder.clone()));
        registry.insert(a.clone());
        registry.insert(b.clone());

        a.heartbeat(100);
        b.heartbeat(110);
        registry.tick(116);

        assert!(!a.is_up(), "a expired");
        assert!(b.is_up(), "b still inside its window");

        registry.remove("a");
        registry.tick(300);
        assert!(!b.is_up(), "b expired on a later tick");
    }
}
