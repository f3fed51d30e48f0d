use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use consmon_db::Store;
use tracing::{debug, info, warn};

use crate::config::{symlink_path, LinkConfig};
use crate::error::Result;
use crate::liveness::{LivenessRegistry, StatePublisher};
use crate::proxy::LinkProxy;
use crate::{
    CONSOLE_PORT_TABLE, CONSOLE_SWITCH_TABLE, CONTROL_TICK, DCE_SWITCH_ENTRY, ENABLED_FIELD,
};

/// What one reconcile pass decided to do, in apply order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    /// Stop a proxy whose configuration disappeared and delete its state
    /// fields.
    Remove(String),
    /// Stop and respawn a proxy whose configuration changed; state fields
    /// stay (the respawned proxy republishes `down` immediately).
    Restart(String),
    /// Spawn a proxy for a new configuration entry.
    Start(String),
}

/// Diff desired configuration against running links.
fn plan(
    desired: &HashMap<String, LinkConfig>,
    running: &HashMap<String, LinkConfig>,
) -> Vec<Action> {
    let mut actions = Vec::new();

    let mut removed: Vec<&String> = running.keys().filter(|id| !desired.contains_key(*id)).collect();
    removed.sort();
    actions.extend(removed.into_iter().map(|id| Action::Remove(id.clone())));

    let mut changed: Vec<&String> = running
        .keys()
        .filter(|id| desired.get(*id).is_some_and(|cfg| cfg != &running[*id]))
        .collect();
    changed.sort();
    actions.extend(changed.into_iter().map(|id| Action::Restart(id.clone())));

    let mut added: Vec<&String> = desired.keys().filter(|id| !running.contains_key(*id)).collect();
    added.sort();
    actions.extend(added.into_iter().map(|id| Action::Start(id.clone())));

    actions
}

/// The DCE-side supervisor: one proxy per configured console port,
/// reconciled against the configuration store.
pub struct Supervisor {
    config_store: Store,
    publisher: Arc<dyn StatePublisher>,
    registry: LivenessRegistry,
    device_prefix: String,
    dev_dir: PathBuf,
    proxies: HashMap<String, LinkProxy>,
    desired: HashMap<String, LinkConfig>,
}

impl Supervisor {
    pub fn new(
        config_store: Store,
        publisher: Arc<dyn StatePublisher>,
        device_prefix: String,
        dev_dir: PathBuf,
    ) -> Self {
        Self {
            config_store,
            publisher,
            registry: LivenessRegistry::new(),
            device_prefix,
            dev_dir,
            proxies: HashMap::new(),
            desired: HashMap::new(),
        }
    }

    /// Is the console management feature switched on?
    pub fn feature_enabled(&mut self) -> Result<bool> {
        let enabled =
            self.config_store
                .hget(CONSOLE_SWITCH_TABLE, DCE_SWITCH_ENTRY, ENABLED_FIELD)?;
        Ok(enabled.as_deref() == Some("yes"))
    }

    /// Main loop: initial sync, then react to configuration changes until
    /// the stop flag is set. The 1 s subscription timeout doubles as the
    /// health tick that reaps and respawns dead proxies.
    pub fn run(&mut self, stop: Arc<AtomicBool>) -> Result<()> {
        let subscription = self.config_store.subscribe(&[
            format!("{CONSOLE_PORT_TABLE}|*"),
            format!("{CONSOLE_SWITCH_TABLE}|*"),
        ])?;
        let ticker = self.registry.spawn_ticker(Arc::clone(&stop))?;

        if let Err(err) = self.sync() {
            warn!(%err, "initial sync failed; retrying on next event");
        }

        while !stop.load(Ordering::SeqCst) {
            match subscription.poll(CONTROL_TICK) {
                Some(event) => {
                    debug!(key = %event.key, op = %event.op, "configuration changed");
                    if let Err(err) = self.sync() {
                        warn!(%err, "sync failed; retrying on next event");
                    }
                }
                None => self.reap_and_respawn(),
            }
        }

        info!("shutting down, stopping {} proxies", self.proxies.len());
        for (_, mut proxy) in self.proxies.drain() {
            proxy.stop();
        }
        subscription.shutdown();
        let _ = ticker.join();
        Ok(())
    }

    /// Bring the running set in line with the store.
    fn sync(&mut self) -> Result<()> {
        if !self.feature_enabled()? {
            if !self.proxies.is_empty() {
                info!("console management disabled, stopping all proxies");
                let ids: Vec<String> = self.proxies.keys().cloned().collect();
                for id in ids {
                    self.remove_link(&id, true);
                }
            }
            self.desired.clear();
            return Ok(());
        }

        self.desired = self.read_configs()?;
        let running: HashMap<String, LinkConfig> = self
            .proxies
            .iter()
            .map(|(id, proxy)| (id.clone(), proxy.config().clone()))
            .collect();

        for action in plan(&self.desired, &running) {
            match action {
                Action::Remove(id) => self.remove_link(&id, true),
                Action::Restart(id) => {
                    self.remove_link(&id, false);
                    self.start_link(&id);
                }
                Action::Start(id) => self.start_link(&id),
            }
        }

        info!(active = self.proxies.len(), "sync complete");
        Ok(())
    }

    fn read_configs(&mut self) -> Result<HashMap<String, LinkConfig>> {
        let mut configs = HashMap::new();
        for link_id in self.config_store.entries(CONSOLE_PORT_TABLE)? {
            let fields = self.config_store.hgetall(CONSOLE_PORT_TABLE, &link_id)?;
            if fields.is_empty() {
                continue;
            }
            match LinkConfig::from_fields(&link_id, &fields, &self.device_prefix) {
                Ok(cfg) => {
                    configs.insert(link_id, cfg);
                }
                Err(err) => warn!(link = %link_id, %err, "skipping unusable configuration"),
            }
        }
        Ok(configs)
    }

    fn start_link(&mut self, link_id: &str) {
        let Some(cfg) = self.desired.get(link_id).cloned() else {
            return;
        };
        let link = symlink_path(&self.dev_dir, &self.device_prefix, link_id);
        match LinkProxy::spawn(cfg, link, Arc::clone(&self.publisher)) {
            Ok(proxy) => {
                self.registry.insert(proxy.liveness());
                self.proxies.insert(link_id.to_string(), proxy);
            }
            Err(err) => {
                // Stays in `desired`; the health tick keeps retrying while
                // the configuration entry exists (device may reappear).
                warn!(link = link_id, %err, "failed to start proxy");
            }
        }
    }

    fn remove_link(&mut self, link_id: &str, clear_state: bool) {
        if let Some(mut proxy) = self.proxies.remove(link_id) {
            proxy.stop();
        }
        self.registry.remove(link_id);
        if clear_state {
            self.publisher.clear_link(link_id);
        }
    }

    /// Health tick: restart proxies that died under us (UART unplug)
    /// while their configuration entry still exists.
    fn reap_and_respawn(&mut self) {
        let dead: Vec<String> = self
            .proxies
            .iter()
            .filter(|(_, proxy)| !proxy.is_healthy())
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            debug!(link = %id, "reaping dead proxy");
            self.remove_link(&id, false);
        }

        let missing: Vec<String> = self
            .desired
            .keys()
            .filter(|id| !self.proxies.contains_key(*id))
            .cloned()
            .collect();
        for id in missing {
            self.start_link(&id);
        }
    }
}
