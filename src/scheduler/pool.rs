use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::job::{Category, JobSnapshot};

/// One remote rig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub address: String,
    pub category: Category,
    pub connected: bool,
    /// Snapshot of the job running on the host, if any
    pub occupant: Option<JobSnapshot>,
}

#[derive(Debug)]
struct PoolState {
    /// Hosts ready for work, in the order they became free
    available: VecDeque<String>,
    /// Every host, in startup order
    hosts: Vec<HostEntry>,
}

impl PoolState {
    fn entry_mut(&mut self, address: &str) -> Option<&mut HostEntry> {
        self.hosts.iter_mut().find(|h| h.address == address)
    }
}

/// The rigs of one category.
///
/// A connected host is either in the available queue or occupied by exactly
/// one job, never both. A host marked disconnected is dropped from rotation
/// for the rest of the process lifetime.
#[derive(Debug)]
pub struct HostPool {
    category: Category,
    state: Mutex<PoolState>,
    released: Notify,
}

impl HostPool {
    pub fn new(category: Category, addresses: &[String]) -> Self {
        let hosts = addresses
            .iter()
            .map(|address| HostEntry {
                address: address.clone(),
                category,
                connected: true,
                occupant: None,
            })
            .collect();
        Self {
            category,
            state: Mutex::new(PoolState {
                available: addresses.iter().cloned().collect(),
                hosts,
            }),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Take the next free host and mark it occupied by `occupant`.
    pub fn try_acquire(&self, occupant: JobSnapshot) -> Option<String> {
        let mut state = self.lock();
        let address = state.available.pop_front()?;
        if let Some(entry) = state.entry_mut(&address) {
            entry.occupant = Some(occupant);
        }
        Some(address)
    }

    /// Wait for a free host. Never returns if every host has been retired.
    pub async fn acquire(&self, occupant: JobSnapshot) -> String {
        loop {
            let notified = self.released.notified();
            if let Some(address) = self.try_acquire(occupant.clone()) {
                tracing::debug!(category = %self.category, host = %address, "Host acquired");
                return address;
            }
            if self.connected_count() == 0 {
                tracing::warn!(category = %self.category, "No connected hosts left, dispatch is stalled");
            }
            notified.await;
        }
    }

    /// Refresh the snapshot shown for an occupied host.
    pub fn update_occupant(&self, address: &str, occupant: JobSnapshot) {
        let mut state = self.lock();
        if let Some(entry) = state.entry_mut(address) {
            if entry.occupant.is_some() {
                entry.occupant = Some(occupant);
            }
        }
    }

    /// Free a host after its job is done. Retired hosts stay out of rotation.
    pub fn release(&self, address: &str) {
        let mut state = self.lock();
        let Some(entry) = state.entry_mut(address) else {
            tracing::warn!(host = %address, "Release of unknown host");
            return;
        };
        entry.occupant = None;
        if !entry.connected {
            return;
        }
        if !state.available.iter().any(|a| a == address) {
            state.available.push_back(address.to_string());
        }
        drop(state);
        self.released.notify_one();
    }

    /// Permanently remove a host from rotation.
    pub fn retire(&self, address: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.entry_mut(address) {
            entry.connected = false;
            entry.occupant = None;
        }
        state.available.retain(|a| a != address);
        tracing::warn!(category = %self.category, host = %address, "Host retired from rotation");
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.lock()
            .hosts
            .iter()
            .any(|h| h.address == address && h.connected)
    }

    /// All hosts in startup order.
    pub fn hosts(&self) -> Vec<HostEntry> {
        self.lock().hosts.clone()
    }

    /// Free hosts, next to be handed out first.
    pub fn available(&self) -> Vec<String> {
        self.lock().available.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().hosts.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.lock().hosts.iter().filter(|h| h.connected).count()
    }

    /// Check that every connected host is either queued or occupied (not
    /// both), that no host is queued twice and that retired hosts are
    /// nowhere in the queue.
    pub fn check_partition(&self) -> bool {
        let state = self.lock();
        for host in &state.hosts {
            let queued = state
                .available
                .iter()
                .filter(|a| **a == host.address)
                .count();
            let occupied = host.occupant.is_some();
            let ok = if host.connected {
                (queued == 1 && !occupied) || (queued == 0 && occupied)
            } else {
                queued == 0 && !occupied
            };
            if !ok {
                return false;
            }
        }
        state
            .available
            .iter()
            .all(|a| state.hosts.iter().any(|h| &h.address == a))
    }
}
