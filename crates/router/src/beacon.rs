//! LAN presence beacon: a periodic UDP broadcast announcing the service,
//! running on its own OS thread. The payload is re-read under the lock on
//! every tick so `update_payload` takes effect without a restart.

use serde_json::json;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_BEACON_PORT: u16 = 52625;
pub const DEFAULT_BEACON_INTERVAL_SECS: u64 = 1;
const MIN_INTERVAL_SECS: u64 = 1;

struct BeaconShared {
    payload: String,
    interval: Duration,
    running: bool,
}

pub struct NetworkBeacon {
    shared: Arc<(Mutex<BeaconShared>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkBeacon {
    pub fn new() -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(BeaconShared {
                    payload: String::new(),
                    interval: Duration::from_secs(DEFAULT_BEACON_INTERVAL_SECS),
                    running: false,
                }),
                Condvar::new(),
            )),
            thread: Mutex::new(None),
        }
    }

    pub fn local_hostname() -> String {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "UnknownHost".to_string())
    }

    pub fn build_standard_payload(hostname: &str, url: &str) -> String {
        json!({
            "service": "lemonade",
            "hostname": hostname,
            "url": url,
        })
        .to_string()
    }

    /// IPv4 private ranges 10/8, 172.16/12, 192.168/16; for callers that
    /// want to filter which interfaces to announce on
    pub fn is_rfc1918(addr: Ipv4Addr) -> bool {
        let octets = addr.octets();
        match octets[0] {
            10 => true,
            172 => (16..=31).contains(&octets[1]),
            192 => octets[1] == 168,
            _ => false,
        }
    }

    /// Swap the broadcast payload atomically; takes effect on the next tick
    pub fn update_payload(&self, payload: String) {
        lock_shared(&self.shared.0).payload = payload;
    }

    pub fn start_broadcasting(&self, port: u16, payload: String, interval_secs: u64) {
        {
            let mut shared = lock_shared(&self.shared.0);
            if shared.running {
                return;
            }
            shared.payload = payload;
            shared.interval = Duration::from_secs(interval_secs.max(MIN_INTERVAL_SECS));
            shared.running = true;
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || broadcast_loop(shared, port));
        *lock_shared(&self.thread) = Some(handle);
        info!("Beacon broadcasting on UDP port {}", port);
    }

    /// Flip the run flag, wake the thread, join it; the socket closes with
    /// the thread.
    pub fn stop_broadcasting(&self) {
        {
            let mut shared = lock_shared(&self.shared.0);
            if !shared.running {
                return;
            }
            shared.running = false;
        }
        self.shared.1.notify_all();

        if let Some(handle) = lock_shared(&self.thread).take() {
            if handle.join().is_err() {
                warn!("Beacon thread panicked during shutdown");
            }
        }
        info!("Beacon stopped");
    }
}

impl Default for NetworkBeacon {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkBeacon {
    fn drop(&mut self) {
        self.stop_broadcasting();
    }
}

fn lock_shared<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The socket is created inside the thread and dropped when it exits
fn broadcast_loop(shared: Arc<(Mutex<BeaconShared>, Condvar)>, port: u16) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Beacon could not create socket: {}", e);
            lock_shared(&shared.0).running = false;
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("Beacon could not enable broadcast: {}", e);
        lock_shared(&shared.0).running = false;
        return;
    }

    let (mutex, condvar) = (&shared.0, &shared.1);
    let mut guard = lock_shared(mutex);
    while guard.running {
        let payload = guard.payload.clone();
        let interval = guard.interval;
        drop(guard);

        if let Err(e) = socket.send_to(payload.as_bytes(), (Ipv4Addr::BROADCAST, port)) {
            warn!("Beacon send failed: {}", e);
        }

        guard = lock_shared(mutex);
        let (next, _timeout) = condvar
            .wait_timeout(guard, interval)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard = next;
    }
}
