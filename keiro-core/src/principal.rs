//! Acting principals and the resolver collaborator used for run-as identities.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::eval::value::Value;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    #[default]
    Anonymous,
    Account,
    Service,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            ..Default::default()
        }
    }

    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            kind: PrincipalKind::System,
            ..Default::default()
        }
    }

    pub fn account(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Account,
            ..Default::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn to_value(&self) -> Value {
        let mut object = IndexMap::new();
        object.insert("_id".to_string(), Value::from(self.id.as_str()));
        object.insert("kind".to_string(), Value::from(self.kind.to_string()));
        if let Some(name) = &self.name {
            object.insert("name".to_string(), Value::from(name.as_str()));
        }
        object.insert(
            "roles".to_string(),
            Value::Array(self.roles.iter().map(|r| Value::from(r.as_str())).collect()),
        );
        Value::Object(object)
    }
}

/// Turns a declared run-as identity into a principal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, id: &str) -> Option<Principal>;
}

/// Resolver used when no access subsystem is wired in: every identity is an account.
#[derive(Debug, Default, Clone)]
pub struct AccountPrincipalResolver;

#[async_trait]
impl PrincipalResolver for AccountPrincipalResolver {
    async fn resolve(&self, id: &str) -> Option<Principal> {
        match id {
            "" => None,
            "system" => Some(Principal::system()),
            "anonymous" => Some(Principal::anonymous()),
            other => Some(Principal::account(other)),
        }
    }
}
