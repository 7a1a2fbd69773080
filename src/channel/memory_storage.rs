//! Memory budget for downloaded channel data.
//!
//! One `MemoryStorage` is constructed per process (or per test) and shared
//! by `Arc` with every channel. A transfer that wants to stay in memory
//! reserves its size first; the reservation is released when the guard
//! drops. Waiters are woken with `notify_all`, since one release may satisfy
//! several of them or none.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct StorageState {
    used: u64,
    /// Set when a reservation had to wait; cleared by `take_waiting_signal`.
    waiting_signal: bool,
    waiters: usize,
}

pub struct MemoryStorage {
    capacity: u64,
    state: Mutex<StorageState>,
    released: Condvar,
}

/// Outcome of a reservation request.
pub struct Admission {
    pub reservation: Option<MemoryReservation>,
    /// The request blocked before being decided.
    pub waited: bool,
}

impl MemoryStorage {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(StorageState {
                used: 0,
                waiting_signal: false,
                waiters: 0,
            }),
            released: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StorageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.lock().used
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.used() as f64 / self.capacity as f64
    }

    /// Number of callers currently blocked in `reserve`.
    pub fn waiters(&self) -> usize {
        self.lock().waiters
    }

    /// Whether some reservation had to wait since the last call.
    pub fn take_waiting_signal(&self) -> bool {
        std::mem::take(&mut self.lock().waiting_signal)
    }

    /// Reserve without blocking.
    pub fn try_reserve(self: &Arc<Self>, bytes: u64) -> Option<MemoryReservation> {
        let mut state = self.lock();
        self.grant(&mut state, bytes)
    }

    /// Reserve `bytes`, waiting up to `timeout` for space if `wait` is set.
    ///
    /// A request larger than the whole budget is declined immediately.
    pub fn reserve(self: &Arc<Self>, bytes: u64, wait: bool, timeout: Duration) -> Admission {
        let mut state = self.lock();
        if let Some(reservation) = self.grant(&mut state, bytes) {
            return Admission {
                reservation: Some(reservation),
                waited: false,
            };
        }
        if !wait || bytes > self.capacity {
            return Admission {
                reservation: None,
                waited: false,
            };
        }

        state.waiting_signal = true;
        state.waiters += 1;
        let deadline = Instant::now() + timeout;
        let reservation = loop {
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            state = match self.released.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
            if let Some(reservation) = self.grant(&mut state, bytes) {
                break Some(reservation);
            }
        };
        state.waiters -= 1;
        tracing::debug!(bytes, granted = reservation.is_some(), "memory reservation waited");
        Admission {
            reservation,
            waited: true,
        }
    }

    fn grant(self: &Arc<Self>, state: &mut StorageState, bytes: u64) -> Option<MemoryReservation> {
        if state.used + bytes > self.capacity {
            return None;
        }
        state.used += bytes;
        Some(MemoryReservation {
            storage: Arc::clone(self),
            bytes,
        })
    }

    fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.lock();
        state.used = state.used.saturating_sub(bytes);
        self.released.notify_all();
    }
}

/// Bytes held against a `MemoryStorage`; released on drop.
pub struct MemoryReservation {
    storage: Arc<MemoryStorage>,
    bytes: u64,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Give back the part of the reservation that turned out unused.
    pub fn shrink_to(&mut self, bytes: u64) {
        if bytes < self.bytes {
            self.storage.release(self.bytes - bytes);
            self.bytes = bytes;
        }
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.storage.release(self.bytes);
    }
}

impl std::fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReservation").field("bytes", &self.bytes).finish()
    }
}
