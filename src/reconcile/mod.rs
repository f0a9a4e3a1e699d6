//! Reconciliation of recorded instances with the remote platform.
//!
//! Remote mutations always happen before the matching local write, and every
//! failure after a remote mutation undoes that mutation before the error is
//! returned. Compensation failures are logged and swallowed so that the error
//! which triggered them is the one the caller sees.
//!
//! Concurrent operations on the same instance id must be serialized by the caller.

pub mod binding;
pub mod diff;

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::apim::models::SubscriptionResponse;
use crate::apim::{subscription_records, ApimClient, ResolvedApi};
use crate::errors::BrokerError;
use crate::hash::fingerprint;
use crate::models::{Api, DesiredSpec, ServiceInstance, Subscription};
use crate::store::Store;
use diff::ApiDiff;

pub use binding::{BindOutcome, Credentials};

pub const APPLICATION_PREFIX: &str = "ServiceBroker_";

/// Caller-supplied ownership of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformContext {
    pub org_id: String,
    pub space_id: String,
}

/// What the caller gets back from a provision request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub instance_id: String,
    pub application_id: String,
    pub application_name: String,
    pub dashboard_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created(ProvisionedInstance),
    /// An identical request was already fulfilled; nothing was changed.
    AlreadyExists(ProvisionedInstance),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    Unchanged,
}

pub fn application_name(instance_id: &str) -> String {
    format!("{}{}", APPLICATION_PREFIX, instance_id)
}

/// Provisions, updates and deprovisions instances and their bindings.
#[derive(Clone)]
pub struct Broker {
    apim: ApimClient,
    store: Arc<dyn Store>,
}

impl Broker {
    pub fn new(apim: ApimClient, store: Arc<dyn Store>) -> Self {
        Self { apim, store }
    }

    /// Create an application subscribed to every desired API and record it.
    ///
    /// A repeat of an already fulfilled request returns `AlreadyExists` without
    /// touching the remote platform; a request that differs in ownership or APIs
    /// is a conflict.
    #[instrument(skip(self, spec, ctx), fields(instance_id = %instance_id, org_id = %ctx.org_id, space_id = %ctx.space_id))]
    pub async fn provision(
        &self,
        instance_id: &str,
        spec: &DesiredSpec,
        ctx: &PlatformContext,
    ) -> Result<ProvisionOutcome, BrokerError> {
        if ctx.org_id.is_empty() || ctx.space_id.is_empty() {
            return Err(BrokerError::InvalidParameters(
                "organization and space GUIDs are required".into(),
            ));
        }
        if spec.is_empty() {
            return Err(BrokerError::InvalidParameters(
                "at least one API is required".into(),
            ));
        }

        let parameter_hash = fingerprint(spec, &ctx.org_id, &ctx.space_id);

        if let Some(existing) = self.load_instance(instance_id).await? {
            let recorded = self.recorded_apis(instance_id).await?;
            let identical = existing.parameter_hash == parameter_hash
                && existing.org_id == ctx.org_id
                && existing.space_id == ctx.space_id
                && recorded == spec.apis;
            if !identical {
                debug!("instance exists with different attributes");
                return Err(BrokerError::Conflict {
                    instance_id: instance_id.to_string(),
                });
            }
            debug!("instance already provisioned");
            return Ok(ProvisionOutcome::AlreadyExists(self.provisioned(&existing)));
        }

        // Resolve every API before mutating anything remotely.
        let resolved = self
            .apim
            .resolve_apis(&spec.apis)
            .await
            .map_err(BrokerError::remote("search API"))?;

        let app_name = application_name(instance_id);
        let application_id = match self.apim.create_application(&app_name).await {
            Ok(id) => id,
            Err(e) if e.is_conflict() => {
                let remote_id = match self.apim.search_application(&app_name).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(application_name = %app_name, error = %e, "unable to look up the existing application");
                        None
                    }
                };
                return Err(BrokerError::RemoteResourceExists {
                    name: app_name,
                    remote_id,
                });
            }
            Err(e) => return Err(BrokerError::remote("create application")(e)),
        };
        info!(application_id = %application_id, "created application");

        let keys = match self.apim.generate_keys(&application_id).await {
            Ok(keys) => keys,
            Err(e) => {
                self.revert_application(&application_id).await;
                return Err(BrokerError::remote("generate application keys")(e));
            }
        };

        let created = match self.apim.create_subscriptions(&application_id, &resolved).await {
            Ok(created) => created,
            Err(e) => {
                self.revert_application(&application_id).await;
                return Err(BrokerError::remote("create subscriptions")(e));
            }
        };
        let subscriptions = match subscription_records(instance_id, &resolved, &created) {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                self.revert_subscriptions(&created_ids(&created)).await;
                self.revert_application(&application_id).await;
                return Err(e.into());
            }
        };

        let instance = ServiceInstance {
            id: instance_id.to_string(),
            application_id: application_id.clone(),
            application_name: app_name,
            org_id: ctx.org_id.clone(),
            space_id: ctx.space_id.clone(),
            consumer_key: keys.consumer_key,
            consumer_secret: keys.consumer_secret,
            parameter_hash,
        };

        if let Err(e) = self.store.insert_instance(&instance).await {
            self.revert_subscriptions(&record_ids(&subscriptions)).await;
            self.revert_application(&application_id).await;
            return Err(BrokerError::persistence("store service instance")(e));
        }

        if let Err(e) = self.store.insert_subscriptions(&subscriptions).await {
            self.revert_subscriptions(&record_ids(&subscriptions)).await;
            self.remove_instance_record(instance_id).await;
            self.revert_application(&application_id).await;
            return Err(BrokerError::persistence("store subscriptions")(e));
        }

        info!(subscriptions = subscriptions.len(), "provisioned service instance");
        Ok(ProvisionOutcome::Created(self.provisioned(&instance)))
    }

    /// Move an instance's subscriptions to the desired API set.
    ///
    /// Additions are applied first, then removals in sorted order. A failed
    /// removal aborts the batch and unsubscribes every added API again.
    /// Removals that completed before the failure stay removed, along with
    /// their records, and the stored hash is left untouched.
    #[instrument(skip(self, spec), fields(instance_id = %instance_id))]
    pub async fn update(
        &self,
        instance_id: &str,
        spec: &DesiredSpec,
    ) -> Result<UpdateOutcome, BrokerError> {
        if spec.is_empty() {
            return Err(BrokerError::InvalidParameters(
                "at least one API is required".into(),
            ));
        }

        let instance = self
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| BrokerError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let recorded = self.recorded_apis(instance_id).await?;
        let parameter_hash = fingerprint(spec, &instance.org_id, &instance.space_id);

        let diff = ApiDiff::between(&recorded, &spec.apis);
        if diff.is_empty() {
            debug!("requested APIs match the recorded subscriptions");
            if instance.parameter_hash != parameter_hash {
                self.record_hash(instance_id, &parameter_hash).await?;
            }
            return Ok(UpdateOutcome::Unchanged);
        }
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "reconciling subscriptions"
        );

        if !diff.added.is_empty() {
            let resolved = self
                .apim
                .resolve_apis(&diff.added)
                .await
                .map_err(BrokerError::remote("search API"))?;
            self.subscribe(&instance, &resolved).await?;
        }

        if let Err(e) = self.remove_apis(&instance, &diff.removed).await {
            self.revert_added_apis(&instance, &diff.added).await;
            return Err(e);
        }

        self.record_hash(instance_id, &parameter_hash).await?;
        info!("updated service instance");
        Ok(UpdateOutcome::Updated)
    }

    /// Delete the remote application, then the record.
    ///
    /// The platform drops an application's subscriptions with it. A record that
    /// cannot be deleted afterwards is reported, but the application is not
    /// re-created.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn deprovision(&self, instance_id: &str) -> Result<(), BrokerError> {
        let instance = self
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| BrokerError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        match self.apim.delete_application(&instance.application_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(application_id = %instance.application_id, "application already deleted");
            }
            Err(e) => return Err(BrokerError::remote("delete application")(e)),
        }

        self.store
            .delete_instance(instance_id)
            .await
            .map_err(BrokerError::persistence("delete service instance"))?;
        info!(application_id = %instance.application_id, "deprovisioned service instance");
        Ok(())
    }

    pub(crate) async fn load_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<ServiceInstance>, BrokerError> {
        self.store
            .get_instance(instance_id)
            .await
            .map_err(BrokerError::persistence("retrieve service instance"))
    }

    async fn recorded_apis(&self, instance_id: &str) -> Result<BTreeSet<Api>, BrokerError> {
        let subscriptions = self
            .store
            .list_subscriptions(instance_id)
            .await
            .map_err(BrokerError::persistence("retrieve subscriptions"))?;
        Ok(subscriptions.iter().map(Subscription::api).collect())
    }

    async fn record_hash(&self, instance_id: &str, parameter_hash: &str) -> Result<(), BrokerError> {
        self.store
            .update_instance_hash(instance_id, parameter_hash)
            .await
            .map_err(BrokerError::persistence("update service instance"))
    }

    fn provisioned(&self, instance: &ServiceInstance) -> ProvisionedInstance {
        ProvisionedInstance {
            instance_id: instance.id.clone(),
            application_id: instance.application_id.clone(),
            application_name: instance.application_name.clone(),
            dashboard_url: self.apim.dashboard_url(&instance.application_name),
        }
    }

    /// Subscribe remotely and record the batch, unsubscribing it again if the
    /// records cannot be written.
    async fn subscribe(
        &self,
        instance: &ServiceInstance,
        resolved: &[ResolvedApi],
    ) -> Result<Vec<Subscription>, BrokerError> {
        let created = self
            .apim
            .create_subscriptions(&instance.application_id, resolved)
            .await
            .map_err(BrokerError::remote("create subscriptions"))?;

        let subscriptions = match subscription_records(&instance.id, resolved, &created) {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                self.revert_subscriptions(&created_ids(&created)).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.insert_subscriptions(&subscriptions).await {
            self.revert_subscriptions(&record_ids(&subscriptions)).await;
            return Err(BrokerError::persistence("store subscriptions")(e));
        }
        Ok(subscriptions)
    }

    async fn remove_apis(
        &self,
        instance: &ServiceInstance,
        apis: &BTreeSet<Api>,
    ) -> Result<(), BrokerError> {
        for api in apis {
            let subscription = self
                .store
                .find_subscription(&instance.application_id, api)
                .await
                .map_err(BrokerError::persistence("retrieve subscription"))?
                .ok_or_else(|| BrokerError::SubscriptionNotFound {
                    application_id: instance.application_id.clone(),
                    api: api.to_string(),
                })?;

            self.apim
                .unsubscribe(&subscription.id)
                .await
                .map_err(BrokerError::remote("remove subscription"))?;
            self.store
                .delete_subscription(&subscription.id)
                .await
                .map_err(BrokerError::persistence("delete subscription"))?;
            debug!(subscription_id = %subscription.id, api = %api, "removed subscription");
        }
        Ok(())
    }

    /// Best effort: every added API is attempted even if an earlier one fails.
    async fn revert_added_apis(&self, instance: &ServiceInstance, apis: &BTreeSet<Api>) {
        for api in apis {
            let subscription = match self
                .store
                .find_subscription(&instance.application_id, api)
                .await
            {
                Ok(Some(subscription)) => subscription,
                Ok(None) => {
                    error!(api = %api, "no subscription recorded for an added API");
                    continue;
                }
                Err(e) => {
                    error!(api = %api, error = %e, "unable to retrieve subscription for revert");
                    continue;
                }
            };

            if let Err(e) = self.apim.unsubscribe(&subscription.id).await {
                error!(subscription_id = %subscription.id, error = %e, "unable to revert subscription");
                continue;
            }
            if let Err(e) = self.store.delete_subscription(&subscription.id).await {
                error!(subscription_id = %subscription.id, error = %e, "unable to delete reverted subscription record");
            }
        }
    }

    async fn revert_subscriptions(&self, subscription_ids: &[String]) {
        for id in subscription_ids {
            if let Err(e) = self.apim.unsubscribe(id).await {
                error!(subscription_id = %id, error = %e, "unable to revert subscription");
            }
        }
    }

    async fn revert_application(&self, application_id: &str) {
        match self.apim.delete_application(application_id).await {
            Ok(()) => debug!(application_id = %application_id, "reverted application"),
            Err(e) => error!(application_id = %application_id, error = %e, "unable to revert application"),
        }
    }

    async fn remove_instance_record(&self, instance_id: &str) {
        if let Err(e) = self.store.delete_instance(instance_id).await {
            error!(instance_id = %instance_id, error = %e, "unable to remove service instance record");
        }
    }
}

fn created_ids(created: &[SubscriptionResponse]) -> Vec<String> {
    created.iter().map(|c| c.subscription_id.clone()).collect()
}

fn record_ids(subscriptions: &[Subscription]) -> Vec<String> {
    subscriptions.iter().map(|s| s.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apim::ApimEndpoints;
    use crate::client::{Invoker, RetryConfig};
    use crate::config::ApimConfig;
    use crate::errors::TokenError;
    use crate::store::MemoryStore;
    use crate::token::TokenSource;
    use async_trait::async_trait;

    struct NoToken;

    #[async_trait]
    impl TokenSource for NoToken {
        async fn token(&self) -> Result<String, TokenError> {
            Err(TokenError::NoScopes)
        }
    }

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn test_application_name_prefix() {
        assert_eq!(application_name("i-1"), "ServiceBroker_i-1");
    }

    /// Handlers spawn these futures on the runtime, so they must be `Send`.
    #[test]
    fn test_operation_futures_are_send() {
        let apim = ApimClient::new(
            ApimEndpoints::new(&ApimConfig::default()).unwrap(),
            Invoker::with_client(reqwest::Client::new(), RetryConfig::default()),
            Arc::new(NoToken),
        );
        let broker = Broker::new(apim, Arc::new(MemoryStore::new()));
        let spec = DesiredSpec::default();
        let ctx = PlatformContext {
            org_id: "org-1".into(),
            space_id: "space-1".into(),
        };

        assert_send(broker.provision("i-1", &spec, &ctx));
        assert_send(broker.update("i-1", &spec));
        assert_send(broker.deprovision("i-1"));
        assert_send(broker.bind("i-1", "b-1", None));
        assert_send(broker.unbind("b-1"));
    }
}
