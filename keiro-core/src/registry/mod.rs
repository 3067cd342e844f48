//! # Runtime registry
//!
//! Handlers are declared while tenant modules load: each call to
//! [`ModuleScope::register_handler`] validates its metadata, normalizes it
//! into a [`Registration`] and admits it into the [`RegistryTable`] being
//! built. A finished table is published with [`Registry::install`], which
//! swaps it in atomically. Dispatch always works on one consistent snapshot.
//!
//! At firing time the [`Resolver`] turns a snapshot plus a fired
//! [`Discriminant`] into the ordered list of handlers to run.

mod error;
mod loader;
mod metadata;
mod registration;
mod resolver;
mod table;

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

pub use error::ConfigurationError;
pub use loader::{ModuleLoader, ModuleScope};
pub use metadata::{EnvironmentSpec, RawMetadata};
pub use registration::{
    Action, Discriminant, EnvironmentFilter, HandlerKind, Method, Params, Registration, SlotKey,
    When, match_path,
};
pub use resolver::{Candidate, Resolver, Selector};
pub use table::RegistryTable;

pub use crate::dispatch::handler::HandlerRef;

/// Process-wide holder of the current [`RegistryTable`].
#[derive(Debug)]
pub struct Registry {
    table: ArcSwap<RegistryTable>,
}

impl Registry {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            table: ArcSwap::from_pointee(RegistryTable::new(environment)),
        }
    }

    /// The table as of now. Later installs do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<RegistryTable> {
        self.table.load_full()
    }

    pub fn environment(&self) -> String {
        self.table.load().environment().to_string()
    }

    /// Replaces the whole table. Returns the installed table.
    pub fn install(&self, mut table: RegistryTable) -> Arc<RegistryTable> {
        let version = self.table.load().version() + 1;
        table.set_version(version);
        let table = Arc::new(table);
        self.table.store(table.clone());
        info!(version, handlers = table.len(), "registry reloaded");
        table
    }
}
