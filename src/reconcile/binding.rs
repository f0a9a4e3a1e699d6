use serde::Serialize;
use tracing::{debug, instrument};

use super::Broker;
use crate::errors::BrokerError;
use crate::models::{Bind, ServiceInstance};

/// Credentials handed to a bound consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Credentials {
    pub application_name: String,
    pub consumer_key: String,
    pub consumer_secret: String,
}

impl From<&ServiceInstance> for Credentials {
    fn from(instance: &ServiceInstance) -> Self {
        Self {
            application_name: instance.application_name.clone(),
            consumer_key: instance.consumer_key.clone(),
            consumer_secret: instance.consumer_secret.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Created(Credentials),
    AlreadyExists(Credentials),
}

impl Broker {
    /// Record a binding and return the instance's credentials.
    ///
    /// `platform_app_id` is absent for service keys; an existing binding then only
    /// has to belong to the same instance to count as a repeat.
    #[instrument(skip(self), fields(instance_id = %instance_id, binding_id = %binding_id))]
    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        platform_app_id: Option<&str>,
    ) -> Result<BindOutcome, BrokerError> {
        let platform_app_id = platform_app_id.filter(|id| !id.is_empty());

        let existing = self
            .store
            .get_bind(binding_id)
            .await
            .map_err(BrokerError::persistence("retrieve bind"))?;

        let instance = self
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| BrokerError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let credentials = Credentials::from(&instance);

        if let Some(bind) = existing {
            let same_instance = bind.instance_id == instance_id;
            let same_app = match platform_app_id {
                Some(app_id) => bind.platform_app_id.as_deref() == Some(app_id),
                None => true,
            };
            if same_instance && same_app {
                debug!("binding already exists");
                return Ok(BindOutcome::AlreadyExists(credentials));
            }
            return Err(BrokerError::BindingConflict {
                binding_id: binding_id.to_string(),
            });
        }

        let bind = Bind {
            id: binding_id.to_string(),
            instance_id: instance_id.to_string(),
            platform_app_id: platform_app_id.map(String::from),
        };
        self.store
            .insert_bind(&bind)
            .await
            .map_err(BrokerError::persistence("store bind"))?;
        debug!(platform_app_id = ?bind.platform_app_id, "stored the bind");
        Ok(BindOutcome::Created(credentials))
    }

    #[instrument(skip(self), fields(binding_id = %binding_id))]
    pub async fn unbind(&self, binding_id: &str) -> Result<(), BrokerError> {
        let bind = self
            .store
            .get_bind(binding_id)
            .await
            .map_err(BrokerError::persistence("retrieve bind"))?
            .ok_or_else(|| BrokerError::BindingNotFound {
                binding_id: binding_id.to_string(),
            })?;

        self.store
            .delete_bind(&bind.id)
            .await
            .map_err(BrokerError::persistence("delete bind"))?;
        debug!(instance_id = %bind.instance_id, "deleted the bind");
        Ok(())
    }
}
