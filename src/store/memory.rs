//! In-memory [`Store`] used when no database is configured, and in tests.
//!
//! All tables sit behind one `RwLock`, so a bulk insert either lands completely
//! or not at all, and cascading deletes are applied under the same write lock.
//! Nothing survives a restart.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::Store;
use crate::models::{Api, Bind, ServiceInstance, Subscription};

#[derive(Debug, Default)]
struct Tables {
    instances: HashMap<String, ServiceInstance>,
    subscriptions: HashMap<String, Subscription>,
    binds: HashMap<String, Bind>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_instance(&self, instance: &ServiceInstance) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        if tables.instances.contains_key(&instance.id) {
            anyhow::bail!("service instance {} already exists", instance.id);
        }
        tables
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> anyhow::Result<Option<ServiceInstance>> {
        Ok(self.tables.read().await.instances.get(instance_id).cloned())
    }

    async fn update_instance_hash(&self, instance_id: &str, parameter_hash: &str) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        match tables.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.parameter_hash = parameter_hash.to_string();
                Ok(())
            }
            None => anyhow::bail!("service instance {} does not exist", instance_id),
        }
    }

    async fn delete_instance(&self, instance_id: &str) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.instances.remove(instance_id).is_none() {
            return Ok(false);
        }
        tables.subscriptions.retain(|_, s| s.instance_id != instance_id);
        tables.binds.retain(|_, b| b.instance_id != instance_id);
        Ok(true)
    }

    async fn insert_subscriptions(&self, subscriptions: &[Subscription]) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;

        // Validate the whole batch before touching the table.
        for (i, sub) in subscriptions.iter().enumerate() {
            if !tables.instances.contains_key(&sub.instance_id) {
                anyhow::bail!(
                    "subscription {} references missing instance {}",
                    sub.id,
                    sub.instance_id
                );
            }
            if tables.subscriptions.contains_key(&sub.id)
                || subscriptions[..i].iter().any(|s| s.id == sub.id)
            {
                anyhow::bail!("subscription {} already exists", sub.id);
            }
        }

        for sub in subscriptions {
            tables.subscriptions.insert(sub.id.clone(), sub.clone());
        }
        Ok(())
    }

    async fn list_subscriptions(&self, instance_id: &str) -> anyhow::Result<Vec<Subscription>> {
        let tables = self.tables.read().await;
        let mut subs: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subs)
    }

    async fn find_subscription(
        &self,
        application_id: &str,
        api: &Api,
    ) -> anyhow::Result<Option<Subscription>> {
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .values()
            .find(|s| {
                s.application_id == application_id
                    && s.api_name == api.name
                    && s.api_version == api.version
            })
            .cloned())
    }

    async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .tables
            .write()
            .await
            .subscriptions
            .remove(subscription_id)
            .is_some())
    }

    async fn insert_bind(&self, bind: &Bind) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.instances.contains_key(&bind.instance_id) {
            anyhow::bail!("bind {} references missing instance {}", bind.id, bind.instance_id);
        }
        if tables.binds.contains_key(&bind.id) {
            anyhow::bail!("bind {} already exists", bind.id);
        }
        tables.binds.insert(bind.id.clone(), bind.clone());
        Ok(())
    }

    async fn get_bind(&self, bind_id: &str) -> anyhow::Result<Option<Bind>> {
        Ok(self.tables.read().await.binds.get(bind_id).cloned())
    }

    async fn delete_bind(&self, bind_id: &str) -> anyhow::Result<bool> {
        Ok(self.tables.write().await.binds.remove(bind_id).is_some())
    }
}
