//! Per-phone pairing throttle.
//!
//! Pairing-code requests are expensive for the upstream service and repeated
//! requests get numbers rate-limited or banned, so each phone gets:
//! - at most one in-flight pairing request (`Busy` otherwise)
//! - a minimum spacing between request starts (`RateLimited` otherwise)
//!
//! Locks live for the process lifetime; there is no eviction.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;
use tracing::debug;

use crate::{
    domain::PhoneKey,
    errors::Error,
    store::{MemoryStore, StateStore},
    Result,
};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(12);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PairingLock {
    pub in_flight: bool,
    pub last_request_at: Option<Instant>,
}

#[derive(Clone)]
pub struct PairingThrottle {
    inner: Arc<ThrottleInner>,
}

struct ThrottleInner {
    min_interval: Duration,
    store: Arc<dyn StateStore<PhoneKey, PairingLock>>,
    // Serializes read-modify-write on the store.
    gate: Mutex<()>,
}

impl PairingThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_store(min_interval, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        min_interval: Duration,
        store: Arc<dyn StateStore<PhoneKey, PairingLock>>,
    ) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                min_interval,
                store,
                gate: Mutex::new(()),
            }),
        }
    }

    pub fn acquire(&self, phone: &PhoneKey) -> Result<PairingLease> {
        self.acquire_at(phone, Instant::now())
    }

    pub fn acquire_at(&self, phone: &PhoneKey, now: Instant) -> Result<PairingLease> {
        let _gate = self.inner.gate.lock().unwrap_or_else(|e| e.into_inner());

        let lock = self.inner.store.get(phone).unwrap_or_default();
        if lock.in_flight {
            return Err(Error::Busy);
        }

        if let Some(last) = lock.last_request_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.inner.min_interval {
                return Err(Error::RateLimited {
                    retry_after: self.inner.min_interval - elapsed,
                });
            }
        }

        self.inner.store.set(
            phone.clone(),
            PairingLock {
                in_flight: true,
                last_request_at: Some(now),
            },
        );
        debug!(phone = %phone, "pairing lease acquired");

        Ok(PairingLease {
            phone: phone.clone(),
            inner: self.inner.clone(),
        })
    }

    /// Snapshot of a phone's lock record (for diagnostics and tests).
    pub fn lock_state(&self, phone: &PhoneKey) -> Option<PairingLock> {
        self.inner.store.get(phone)
    }
}

impl ThrottleInner {
    fn release(&self, phone: &PhoneKey) {
        let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let mut lock = self.store.get(phone).unwrap_or_default();
        lock.in_flight = false;
        self.store.set(phone.clone(), lock);
    }
}

/// Proof of an in-flight pairing request. Released on drop, on every path.
pub struct PairingLease {
    phone: PhoneKey,
    inner: Arc<ThrottleInner>,
}

impl Drop for PairingLease {
    fn drop(&mut self) {
        self.inner.release(&self.phone);
        debug!(phone = %self.phone, "pairing lease released");
    }
}
