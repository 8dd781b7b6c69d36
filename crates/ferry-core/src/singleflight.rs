use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Collapses concurrent work on the same key into one flight.
///
/// The first caller for a key becomes the leader and must either
/// [`FlightGuard::complete`] with the outcome or drop the guard; every caller that
/// arrives while the flight is open observes the same outcome. A leader dropped
/// without completing releases its followers with `None` so one of them can retry.
pub struct Singleflight<T: Clone> {
    flights: Mutex<HashMap<String, Flight<T>>>,
    next_ticket: AtomicU64,
}

struct Flight<T> {
    ticket: u64,
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }
}

impl<T: Clone> Singleflight<T> {
    pub fn begin(&self, key: &str) -> FlightGuard<'_, T> {
        let mut map = self.flights.lock();
        if let Some(flight) = map.get(key) {
            return FlightGuard {
                singleflight: self,
                key: key.to_string(),
                role: Role::Follower(flight.rx.clone()),
            };
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        map.insert(key.to_string(), Flight { ticket, rx });
        FlightGuard {
            singleflight: self,
            key: key.to_string(),
            role: Role::Leader { ticket, tx: Some(tx) },
        }
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.flights.lock().keys().cloned().collect()
    }

    fn release(&self, key: &str, ticket: u64) {
        let mut map = self.flights.lock();
        if map.get(key).is_some_and(|f| f.ticket == ticket) {
            map.remove(key);
        }
    }
}

enum Role<T> {
    Leader {
        ticket: u64,
        tx: Option<watch::Sender<Option<T>>>,
    },
    Follower(watch::Receiver<Option<T>>),
}

pub struct FlightGuard<'a, T: Clone> {
    singleflight: &'a Singleflight<T>,
    key: String,
    role: Role<T>,
}

impl<T: Clone> FlightGuard<'_, T> {
    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// Wait for the leader's outcome. `None` means the leader went away without one.
    pub async fn wait(self) -> Option<T> {
        let mut rx = match &self.role {
            Role::Follower(rx) => rx.clone(),
            Role::Leader { .. } => return None,
        };
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return Some(value);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Publish the outcome and close the flight. The next `begin` starts a new one.
    pub fn complete(&mut self, value: T) {
        if let Role::Leader { ticket, tx } = &mut self.role {
            self.singleflight.release(&self.key, *ticket);
            if let Some(tx) = tx.take() {
                tx.send_replace(Some(value));
            }
        }
    }
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if let Role::Leader { ticket, tx } = &mut self.role {
            if tx.take().is_some() {
                self.singleflight.release(&self.key, *ticket);
            }
        }
    }
}
