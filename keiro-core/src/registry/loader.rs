use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::error::ConfigurationError;
use super::metadata::RawMetadata;
use super::registration::{HandlerKind, SlotKey};
use super::table::RegistryTable;
use crate::dispatch::handler::{Handler, HandlerRef, ScriptHost};

/// Builds a fresh [`RegistryTable`] from a sequence of module loads.
///
/// Nothing becomes visible to dispatch until the finished table is installed
/// with [`Registry::install`](super::Registry::install).
pub struct ModuleLoader {
    table: RegistryTable,
    host: Option<Arc<dyn ScriptHost>>,
    sequence: u64,
}

impl ModuleLoader {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            table: RegistryTable::new(environment),
            host: None,
            sequence: 0,
        }
    }

    pub fn with_host(mut self, host: Arc<dyn ScriptHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Starts loading one module. Registrations made through the returned
    /// scope are admitted immediately, in call order.
    pub fn module(&mut self, resource: impl Into<String>) -> ModuleScope<'_> {
        ModuleScope {
            loader: self,
            resource: resource.into(),
            seen: HashSet::new(),
            definitions: HashMap::new(),
        }
    }

    pub fn finish(self) -> RegistryTable {
        self.table
    }
}

pub struct ModuleScope<'a> {
    loader: &'a mut ModuleLoader,
    resource: String,
    seen: HashSet<SlotKey>,
    definitions: HashMap<String, Arc<dyn Handler>>,
}

impl std::fmt::Debug for ModuleScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleScope")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl ModuleScope<'_> {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Makes a module-local function available to `HandlerRef::Named` and
    /// `onComplete` lookups.
    pub fn define(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.definitions.insert(name.into(), handler);
        self
    }

    pub fn register_handler(
        &mut self,
        kind: HandlerKind,
        handler_id: &str,
        metadata: serde_json::Value,
        handler: HandlerRef,
    ) -> Result<&mut Self, ConfigurationError> {
        let mut raw = RawMetadata::parse(handler_id, metadata)?;
        let callable = self.callable(handler_id, handler)?;
        let on_complete = match raw.on_complete.take() {
            Some(name) => Some(self.callable(&name, HandlerRef::Named(name.clone()))?),
            None => None,
        };
        let mut registration =
            raw.into_registration(kind, &self.resource, handler_id, callable, on_complete)?;

        let slot = registration.slot_key();
        if !self.seen.insert(slot.clone()) {
            return Err(ConfigurationError::DuplicateMarker {
                resource: self.resource.clone(),
                slot: slot.to_string(),
            });
        }

        self.loader.sequence += 1;
        registration.sequence = self.loader.sequence;
        debug!(slot = %slot, discriminant = %registration.discriminant, "registering handler");
        self.loader.table.admit(registration);
        Ok(self)
    }

    fn callable(&self, handler: &str, reference: HandlerRef) -> Result<Arc<dyn Handler>, ConfigurationError> {
        let resolved = match reference {
            HandlerRef::Direct(handler) => Some(handler),
            HandlerRef::Named(name) => self.definitions.get(&name).cloned().or_else(|| {
                self.loader
                    .host
                    .as_ref()
                    .and_then(|host| host.resolve(&self.resource, &name))
            }),
        };
        resolved.ok_or_else(|| ConfigurationError::NonCallableHandler {
            resource: self.resource.clone(),
            handler: handler.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::{handler_fn, MockScriptHost};
    use crate::eval::Value;
    use crate::registry::registration::Discriminant;
    use serde_json::json;

    fn noop() -> HandlerRef {
        HandlerRef::Direct(handler_fn(|_| async { Ok(Value::Null) }))
    }

    #[test]
    fn test_duplicate_in_one_module_fails() {
        let mut loader = ModuleLoader::new("production");
        let mut module = loader.module("c_lib");
        module
            .register_handler(HandlerKind::Event, "run", json!({ "event": "a" }), noop())
            .unwrap();
        let err = module
            .register_handler(HandlerKind::Event, "run", json!({ "event": "b" }), noop())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateMarker { .. }));
        // a different weight is a different slot
        module
            .register_handler(HandlerKind::Event, "run", json!({ "event": "b", "weight": 1 }), noop())
            .unwrap();
    }

    #[test]
    fn test_later_module_replaces_slot_in_place() {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("a")
            .register_handler(
                HandlerKind::Event,
                "run",
                json!({ "event": "first", "className": "Lib" }),
                noop(),
            )
            .unwrap()
            .register_handler(HandlerKind::Event, "other", json!({ "event": "x" }), noop())
            .unwrap();
        loader
            .module("b")
            .register_handler(
                HandlerKind::Event,
                "run",
                json!({ "event": "second", "className": "Lib" }),
                noop(),
            )
            .unwrap();
        let table = loader.finish();
        let events = table.get(HandlerKind::Event);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].discriminant, Discriminant::event("second"));
        assert_eq!(events[0].resource, "b");
        assert_eq!(events[0].sequence, 1);
    }

    #[test]
    fn test_inactive_and_foreign_environment_not_admitted() {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("a")
            .register_handler(HandlerKind::Event, "off", json!({ "event": "x", "active": false }), noop())
            .unwrap()
            .register_handler(
                HandlerKind::Event,
                "dev",
                json!({ "event": "x", "environment": "development" }),
                noop(),
            )
            .unwrap();
        assert!(loader.finish().is_empty());
    }

    #[test]
    fn test_named_handlers_resolve_locally_then_through_host() {
        let mut host = MockScriptHost::new();
        host.expect_resolve().returning(|resource, name| {
            (resource == "a" && name == "fromHost")
                .then(|| handler_fn(|_| async { Ok(Value::Null) }))
        });

        let mut loader = ModuleLoader::new("production").with_host(Arc::new(host));
        let mut module = loader.module("a");
        module.define("local", handler_fn(|_| async { Ok(Value::Null) }));
        module
            .register_handler(
                HandlerKind::Event,
                "one",
                json!({ "event": "x", "onComplete": "local" }),
                HandlerRef::Named("fromHost".into()),
            )
            .unwrap();
        let err = module
            .register_handler(HandlerKind::Event, "two", json!({ "event": "x" }), HandlerRef::Named("nope".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::NonCallableHandler { .. }));

        let table = loader.finish();
        assert!(table.get(HandlerKind::Event)[0].on_complete.is_some());
    }
}
