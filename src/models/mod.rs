//! Records the broker keeps about what it provisioned, and the caller's desired state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A remote API identified by name and version. Ordering and equality use both fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Api {
    pub name: String,
    pub version: String,
}

impl Api {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// The set of APIs a caller wants an instance subscribed to.
///
/// Built from a list, so duplicates in the submission collapse and ordering is lost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSpec {
    pub apis: BTreeSet<Api>,
}

impl DesiredSpec {
    pub fn new(apis: impl IntoIterator<Item = Api>) -> Self {
        Self {
            apis: apis.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }
}

/// Provisioned application and the credentials generated for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServiceInstance {
    pub id: String,
    pub application_id: String,
    pub application_name: String,
    pub org_id: String,
    pub space_id: String,
    pub consumer_key: String,
    #[serde(skip_serializing)]
    pub consumer_secret: String,
    pub parameter_hash: String,
}

/// One remote subscription of an instance's application to an API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: String,
    pub application_id: String,
    pub api_name: String,
    pub api_version: String,
    pub user: String,
    pub instance_id: String,
}

impl Subscription {
    pub fn api(&self) -> Api {
        Api::new(self.api_name.clone(), self.api_version.clone())
    }
}

/// A consumer's claim on an instance's credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bind {
    pub id: String,
    pub instance_id: String,
    pub platform_app_id: Option<String>,
}
