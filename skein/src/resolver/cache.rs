//! Process-wide DNS cache with TTL expiry, shared by every session and
//! resolver variant.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

const MAX_TTL: Duration = Duration::from_secs(86_400);
const MAX_ENTRIES: usize = 4096;

struct Entry {
    addrs: Vec<IpAddr>,
    expires: Instant,
}

fn table() -> &'static Mutex<HashMap<String, Entry>> {
    static TABLE: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn get(host: &str) -> Option<Vec<IpAddr>> {
    let table = table().lock().expect("dns cache poisoned");
    let entry = table.get(host)?;
    if Instant::now() >= entry.expires {
        return None;
    }
    Some(entry.addrs.clone())
}

pub fn put(host: &str, addrs: &[IpAddr], ttl: Duration) {
    if addrs.is_empty() || ttl.is_zero() {
        return;
    }
    let mut table = table().lock().expect("dns cache poisoned");
    if table.len() >= MAX_ENTRIES {
        let now = Instant::now();
        table.retain(|_, e| e.expires > now);
        if table.len() >= MAX_ENTRIES {
            table.clear();
        }
    }
    table.insert(
        host.to_string(),
        Entry {
            addrs: addrs.to_vec(),
            expires: Instant::now() + ttl.min(MAX_TTL),
        },
    );
}

/// Drop one host's entry (tests and explicit invalidation).
pub fn evict(host: &str) {
    table().lock().expect("dns cache poisoned").remove(host);
}
