// COUNTER FRAME
//
// A shared counter surface lets other processes observe engine activity
// without talking to the engine directly. Wiring that up to actual shared
// memory is out of scope here (it is NIC/platform specific), but the engine
// still needs something to commit counters *to*. This module is that
// minimal default: an in-process registry keyed by path-like names
// ("apps/<name>/<counter>", "links/<name>/<counter>", "engine/<counter>"),
// committed to periodically by the engine rather than updated on every
// packet.
//
//   CounterFrame - per-app handle to a set of named counters
//   publish(name, value) / read(name) -> Option<u64> - direct registry access
//   snapshot() -> HashMap<String, u64> - point-in-time copy of the registry

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use once_cell::sync::Lazy;

static REGISTRY: Lazy<Mutex<HashMap<String, u64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn publish(name: &str, value: u64) {
    REGISTRY.lock().unwrap().insert(name.to_string(), value);
}

pub fn read(name: &str) -> Option<u64> {
    REGISTRY.lock().unwrap().get(name).copied()
}

pub fn snapshot() -> HashMap<String, u64> {
    REGISTRY.lock().unwrap().clone()
}

// A named set of counters owned by one app instance. Apps declare the
// counter names they want tracked (AppConfig::counter_frame_keys); the
// engine creates the frame on start, and the app increments it directly
// during pull/push. Dropping the frame (app stop/restart) removes its
// entries from the registry so stale per-instance counters don't linger.
pub struct CounterFrame {
    owner: String,
    counters: HashMap<String, u64>,
    created: Instant,
}

impl CounterFrame {
    pub fn new(owner: &str, keys: &[String]) -> Self {
        let mut counters = HashMap::new();
        for k in keys {
            counters.insert(k.clone(), 0);
        }
        CounterFrame { owner: owner.to_string(), counters, created: Instant::now() }
    }

    // Age of this frame since it was created, for reporting how long an app
    // instance (or its restart) has been running.
    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn add(&mut self, key: &str, n: u64) {
        if let Some(v) = self.counters.get_mut(key) {
            *v += n;
        }
    }

    pub fn get(&self, key: &str) -> u64 {
        *self.counters.get(key).unwrap_or(&0)
    }

    // Push this frame's current values into the global registry. Called by
    // the engine periodically rather than on every packet, to keep the
    // registry lock off the hot path.
    pub fn commit(&self) {
        for (key, value) in &self.counters {
            publish(&format!("apps/{}/{}", self.owner, key), *value);
        }
    }
}

impl Drop for CounterFrame {
    fn drop(&mut self) {
        let prefix = format!("apps/{}/", self.owner);
        REGISTRY.lock().unwrap().retain(|k, _| !k.starts_with(&prefix));
    }
}
