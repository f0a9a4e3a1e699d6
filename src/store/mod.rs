//! Persistence of instances, subscriptions and bindings.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::{Api, Bind, ServiceInstance, Subscription};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Record store consumed by the reconciliation engine.
///
/// `insert_subscriptions` must be all-or-nothing; compensation after a failed
/// batch assumes no row of it was written. Deleting an instance removes its
/// subscriptions and bindings with it.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_instance(&self, instance: &ServiceInstance) -> anyhow::Result<()>;
    async fn get_instance(&self, instance_id: &str) -> anyhow::Result<Option<ServiceInstance>>;
    async fn update_instance_hash(&self, instance_id: &str, parameter_hash: &str) -> anyhow::Result<()>;
    async fn delete_instance(&self, instance_id: &str) -> anyhow::Result<bool>;

    async fn insert_subscriptions(&self, subscriptions: &[Subscription]) -> anyhow::Result<()>;
    async fn list_subscriptions(&self, instance_id: &str) -> anyhow::Result<Vec<Subscription>>;
    async fn find_subscription(
        &self,
        application_id: &str,
        api: &Api,
    ) -> anyhow::Result<Option<Subscription>>;
    async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<bool>;

    async fn insert_bind(&self, bind: &Bind) -> anyhow::Result<()>;
    async fn get_bind(&self, bind_id: &str) -> anyhow::Result<Option<Bind>>;
    async fn delete_bind(&self, bind_id: &str) -> anyhow::Result<bool>;
}
