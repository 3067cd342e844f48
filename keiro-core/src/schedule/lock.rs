use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct LockEntry {
    holder: Uuid,
    expires_at: Instant,
    token: CancellationToken,
}

/// Per-job-name overlap locks with a time-to-live.
///
/// A lock whose holder stops refreshing it expires after the TTL and is
/// free again, so a crashed run never blocks its job forever.
#[derive(Debug, Clone)]
pub struct JobLocks {
    entries: Arc<DashMap<String, LockEntry>>,
    ttl: Duration,
}

#[derive(Debug)]
pub enum Acquisition {
    Acquired(JobLease),
    /// Another run holds the lock and the job does not restart.
    Busy,
    /// The previous holder was cancelled and the lock taken over.
    Superseded(JobLease),
}

impl JobLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Tries to take the lock for `name`. `token` belongs to the run that
    /// would hold it and is cancelled if a restarting run supersedes it.
    pub fn try_acquire(&self, name: &str, restart: bool, token: CancellationToken) -> Acquisition {
        let now = Instant::now();
        let entry = LockEntry {
            holder: Uuid::new_v4(),
            expires_at: now + self.ttl,
            token,
        };
        let holder = entry.holder;
        let superseded = match self.entries.entry(name.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                false
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    debug!(job = name, "taking over expired lock");
                    occupied.insert(entry);
                    false
                } else if restart {
                    occupied.get().token.cancel();
                    occupied.insert(entry);
                    true
                } else {
                    return Acquisition::Busy;
                }
            }
        };
        let lease = JobLease {
            locks: self.clone(),
            name: name.to_string(),
            holder,
            keep_alive: None,
        };
        if superseded {
            Acquisition::Superseded(lease)
        } else {
            Acquisition::Acquired(lease)
        }
    }

    /// Whether `name` is locked by an unexpired holder.
    pub fn is_held(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|e| e.expires_at > Instant::now())
    }

    fn refresh(&self, name: &str, holder: Uuid) -> bool {
        match self.entries.get_mut(name) {
            Some(mut entry) if entry.holder == holder => {
                entry.expires_at = Instant::now() + self.ttl;
                true
            }
            _ => false,
        }
    }

    fn release(&self, name: &str, holder: Uuid) {
        if self.entries.remove_if(name, |_, e| e.holder == holder).is_some() {
            trace!(job = name, "lock released");
        }
    }
}

/// Ownership of one job lock. Dropping the lease releases the lock unless
/// another run has taken it over since.
#[derive(Debug)]
pub struct JobLease {
    locks: JobLocks,
    name: String,
    holder: Uuid,
    keep_alive: Option<JoinHandle<()>>,
}

impl JobLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extends the TTL. False once the lock belongs to someone else.
    pub fn refresh(&self) -> bool {
        self.locks.refresh(&self.name, self.holder)
    }

    /// Refreshes the lock every `interval` until the lease is dropped or
    /// loses the lock.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        let locks = self.locks.clone();
        let name = self.name.clone();
        let holder = self.holder;
        self.keep_alive = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if !locks.refresh(&name, holder) {
                    break;
                }
            }
        }));
        self
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive.take() {
            handle.abort();
        }
        self.locks.release(&self.name, self.holder);
    }
}
