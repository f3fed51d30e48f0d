use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use redis::{Commands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{DbError, Result};

/// Read timeout on the subscription connection; bounds how long the
/// watcher thread can sit blind to the stop flag.
const SUBSCRIBE_POLL: Duration = Duration::from_secs(1);

/// How many queued notifications to hold before dropping; the consumer
/// re-reads full state on every event, so drops only delay convergence by
/// one event.
const EVENT_QUEUE_DEPTH: usize = 64;

/// A keyspace change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// The full key that changed, e.g. `CONSOLE_PORT|link1`.
    pub key: String,
    /// The store operation, e.g. `hset`, `hdel`, `del`.
    pub op: String,
}

/// A handle on one logical database.
///
/// All writes are hash-merge operations and all deletes are field-level;
/// a `Store` never replaces or drops a whole key, because other components
/// own sibling fields under the same keys.
pub struct Store {
    client: redis::Client,
    con: redis::Connection,
    name: String,
    db_id: i64,
    separator: String,
}

impl Store {
    /// Resolve `name` through the topology and connect.
    pub fn open(cfg: &StoreConfig, name: &str) -> Result<Self> {
        let (db, instance) = cfg.database(name)?;

        let addr = match &instance.unix_socket_path {
            Some(path) => ConnectionAddr::Unix(path.clone()),
            None => {
                let host = instance
                    .hostname
                    .clone()
                    .ok_or_else(|| DbError::BadInstance {
                        name: name.to_string(),
                    })?;
                ConnectionAddr::Tcp(host, instance.port.unwrap_or(6379))
            }
        };

        let client = redis::Client::open(ConnectionInfo {
            addr,
            redis: RedisConnectionInfo {
                db: db.id,
                ..Default::default()
            },
        })?;
        let mut con = client.get_connection()?;
        redis::cmd("PING").query::<String>(&mut con)?;
        info!(db = name, id = db.id, "connected to store");

        Ok(Self {
            client,
            con,
            name: name.to_string(),
            db_id: db.id,
            separator: db.separator.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Build the store key for a table entry.
    pub fn key(&self, table: &str, entry: &str) -> String {
        format_key(&self.separator, table, entry)
    }

    pub fn hget(&mut self, table: &str, entry: &str, field: &str) -> Result<Option<String>> {
        let key = self.key(table, entry);
        Ok(self.con.hget(key, field)?)
    }

    pub fn hgetall(&mut self, table: &str, entry: &str) -> Result<HashMap<String, String>> {
        let key = self.key(table, entry);
        Ok(self.con.hgetall(key)?)
    }

    /// Merge fields into a hash; sibling fields are untouched.
    pub fn hset(&mut self, table: &str, entry: &str, fields: &[(&str, String)]) -> Result<()> {
        let key = self.key(table, entry);
        self.con.hset_multiple::<_, _, _, ()>(key, fields)?;
        Ok(())
    }

    /// Delete exactly the named fields; the key itself survives as long as
    /// anyone else still has fields in it.
    pub fn hdel(&mut self, table: &str, entry: &str, fields: &[&str]) -> Result<()> {
        let key = self.key(table, entry);
        self.con.hdel::<_, _, ()>(key, fields.to_vec())?;
        Ok(())
    }

    /// Enumerate entry names in a table (`KEYS table<sep>*`).
    pub fn entries(&mut self, table: &str) -> Result<Vec<String>> {
        let pattern = self.key(table, "*");
        let keys: Vec<String> = self.con.keys(pattern)?;
        let prefix = self.key(table, "");
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Subscribe to keyspace notifications for the given key patterns
    /// (e.g. `CONSOLE_PORT|*`). Events arrive on a queue the caller polls
    /// with a timeout, so one thread can service both notifications and
    /// its shutdown flag.
    pub fn subscribe(&self, key_patterns: &[String]) -> Result<Subscription> {
        let patterns: Vec<String> = key_patterns
            .iter()
            .map(|p| keyspace_channel(self.db_id, p))
            .collect();
        Subscription::spawn(self.client.clone(), self.name.clone(), patterns)
    }
}

/// A background keyspace subscription feeding a bounded event queue.
pub struct Subscription {
    rx: Receiver<KeyEvent>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    fn spawn(client: redis::Client, db_name: String, patterns: Vec<String>) -> Result<Subscription> {
        let (tx, rx) = std::sync::mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));

        // Probe the subscription once in the caller so startup failures
        // surface as errors instead of a silent dead queue.
        let mut con = client.get_connection()?;
        {
            let mut pubsub = con.as_pubsub();
            for pattern in &patterns {
                pubsub.psubscribe(pattern)?;
            }
        }
        drop(con);

        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("consmon-sub-{db_name}"))
            .spawn(move || watch_loop(&client, &db_name, &patterns, &thread_stop, &tx))
            .map_err(|err| DbError::Store(err.into()))?;

        Ok(Subscription {
            rx,
            stop,
            handle: Some(handle),
        })
    }

    /// Wait up to `timeout` for the next notification.
    pub fn poll(&self, timeout: Duration) -> Option<KeyEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Stop the watcher thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn watch_loop(
    client: &redis::Client,
    db_name: &str,
    patterns: &[String],
    stop: &AtomicBool,
    tx: &SyncSender<KeyEvent>,
) {
    while !stop.load(Ordering::SeqCst) {
        let mut con = match client.get_connection() {
            Ok(con) => con,
            Err(err) => {
                warn!(db = db_name, %err, "subscription connect failed; retrying");
                std::thread::sleep(SUBSCRIBE_POLL);
                continue;
            }
        };

        let mut pubsub = con.as_pubsub();
        let subscribed = patterns.iter().try_for_each(|p| pubsub.psubscribe(p));
        if let Err(err) = subscribed.and_then(|()| pubsub.set_read_timeout(Some(SUBSCRIBE_POLL))) {
            warn!(db = db_name, %err, "subscription setup failed; retrying");
            std::thread::sleep(SUBSCRIBE_POLL);
            continue;
        }
        debug!(db = db_name, ?patterns, "keyspace subscription active");

        while !stop.load(Ordering::SeqCst) {
            match pubsub.get_message() {
                Ok(msg) => {
                    let channel = msg.get_channel_name().to_string();
                    let op: String = msg.get_payload().unwrap_or_default();
                    let Some(key) = channel.split_once(':').map(|(_, k)| k.to_string()) else {
                        continue;
                    };
                    debug!(db = db_name, key = %key, op = %op, "keyspace event");
                    // A full queue means the consumer is mid-resync; the
                    // event it will act on is the state it re-reads anyway.
                    let _ = tx.try_send(KeyEvent { key, op });
                }
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    warn!(db = db_name, %err, "subscription lost; reconnecting");
                    break;
                }
            }
        }
    }
}

/// `<table><sep><entry>`.
pub fn format_key(separator: &str, table: &str, entry: &str) -> String {
    format!("{table}{separator}{entry}")
}

/// Keyspace notification channel for a key pattern in a numeric database.
pub fn keyspace_channel(db_id: i64, key_pattern: &str) -> String {
    format!("__keyspace@{db_id}__:{key_pattern}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formatting_uses_configured_separator() {
        assert_eq!(format_key("|", "CONSOLE_PORT", "link1"), "CONSOLE_PORT|link1");
        assert_eq!(format_key(":", "CONSOLE_PORT", "link1"), "CONSOLE_PORT:link1");
        assert_eq!(format_key("|", "CONSOLE_PORT", "*"), "CONSOLE_PORT|*");
    }

    #[test]
    fn keyspace_channel_format() {
        assert_eq!(
            keyspace_channel(4, "CONSOLE_PORT|*"),
            "__keyspace@4__:CONSOLE_PORT|*"
        );
        assert_eq!(
            keyspace_channel(6, "CONSOLE_SWITCH|*"),
            "__keyspace@6__:CONSOLE_SWITCH|*"
        );
    }

    #[test]
    fn channel_name_splits_into_key() {
        let channel = keyspace_channel(4, "CONSOLE_PORT|link1");
        let (_, key) = channel.split_once(':').unwrap();
        assert_eq!(key, "CONSOLE_PORT|link1");
    }
}
