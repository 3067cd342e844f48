use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::registration::{HandlerKind, Registration, SlotKey};

/// Per-kind ordered handler lists. Order is module load order; a replaced
/// slot keeps the position of the registration it replaced.
#[derive(Debug, Clone, Default)]
pub struct RegistryTable {
    environment: String,
    version: u64,
    entries: HashMap<HandlerKind, Vec<Arc<Registration>>>,
}

impl RegistryTable {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn get(&self, kind: HandlerKind) -> &[Arc<Registration>] {
        self.entries.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn find(&self, slot: &SlotKey) -> Option<&Arc<Registration>> {
        self.get(slot.kind).iter().find(|r| &r.slot_key() == slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Registration>> {
        self.entries.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `registration` unless it is inactive or filtered out by
    /// environment. Returns whether it was admitted.
    pub(crate) fn admit(&mut self, mut registration: Registration) -> bool {
        if !registration.active || !registration.environment.matches(&self.environment) {
            debug!(
                handler = %registration.describe(),
                active = registration.active,
                "registration not admitted"
            );
            return false;
        }
        let slot = registration.slot_key();
        let list = self.entries.entry(registration.kind).or_default();
        match list.iter().position(|r| r.slot_key() == slot) {
            Some(index) => {
                registration.sequence = list[index].sequence;
                debug!(slot = %slot, "registration replaced");
                list[index] = Arc::new(registration);
            }
            None => list.push(Arc::new(registration)),
        }
        true
    }
}
