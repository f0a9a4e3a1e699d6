//! Shared doubles for the integration tests: a fixed token source, a store that
//! fails on demand, and wiremock helpers for the API Manager REST surface.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use apim_broker::apim::{ApimClient, ApimEndpoints};
use apim_broker::client::{is_error_response, Invoker, RetryConfig};
use apim_broker::config::ApimConfig;
use apim_broker::errors::TokenError;
use apim_broker::hash::fingerprint;
use apim_broker::models::{Api, Bind, DesiredSpec, ServiceInstance, Subscription};
use apim_broker::reconcile::{Broker, PlatformContext};
use apim_broker::store::{MemoryStore, Store};
use apim_broker::token::TokenSource;

pub const APPLICATIONS: &str = "/api/am/store/v0.14/applications";
pub const GENERATE_KEYS: &str = "/api/am/store/v0.14/applications/generate-keys";
pub const SUBSCRIPTIONS: &str = "/api/am/store/v0.14/subscriptions";
pub const MULTIPLE_SUBSCRIPTIONS: &str = "/api/am/store/v0.14/subscriptions/multiple";
pub const PUBLISHER_APIS: &str = "/api/am/publisher/v0.14/apis";

pub struct StaticToken;

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, TokenError> {
        Ok("test-token".into())
    }
}

/// Memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_insert_instance: AtomicBool,
    pub fail_insert_subscriptions: AtomicBool,
    pub fail_delete_instance: AtomicBool,
}

impl FaultyStore {
    fn check(flag: &AtomicBool, op: &str) -> anyhow::Result<()> {
        if flag.load(Ordering::SeqCst) {
            anyhow::bail!("injected failure: {}", op);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn insert_instance(&self, instance: &ServiceInstance) -> anyhow::Result<()> {
        Self::check(&self.fail_insert_instance, "insert instance")?;
        self.inner.insert_instance(instance).await
    }

    async fn get_instance(&self, instance_id: &str) -> anyhow::Result<Option<ServiceInstance>> {
        self.inner.get_instance(instance_id).await
    }

    async fn update_instance_hash(&self, instance_id: &str, parameter_hash: &str) -> anyhow::Result<()> {
        self.inner.update_instance_hash(instance_id, parameter_hash).await
    }

    async fn delete_instance(&self, instance_id: &str) -> anyhow::Result<bool> {
        Self::check(&self.fail_delete_instance, "delete instance")?;
        self.inner.delete_instance(instance_id).await
    }

    async fn insert_subscriptions(&self, subscriptions: &[Subscription]) -> anyhow::Result<()> {
        Self::check(&self.fail_insert_subscriptions, "insert subscriptions")?;
        self.inner.insert_subscriptions(subscriptions).await
    }

    async fn list_subscriptions(&self, instance_id: &str) -> anyhow::Result<Vec<Subscription>> {
        self.inner.list_subscriptions(instance_id).await
    }

    async fn find_subscription(
        &self,
        application_id: &str,
        api: &Api,
    ) -> anyhow::Result<Option<Subscription>> {
        self.inner.find_subscription(application_id, api).await
    }

    async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<bool> {
        self.inner.delete_subscription(subscription_id).await
    }

    async fn insert_bind(&self, bind: &Bind) -> anyhow::Result<()> {
        self.inner.insert_bind(bind).await
    }

    async fn get_bind(&self, bind_id: &str) -> anyhow::Result<Option<Bind>> {
        self.inner.get_bind(bind_id).await
    }

    async fn delete_bind(&self, bind_id: &str) -> anyhow::Result<bool> {
        self.inner.delete_bind(bind_id).await
    }
}

pub fn apim_client(server: &MockServer) -> ApimClient {
    let config = ApimConfig {
        token_endpoint: server.uri(),
        dynamic_client_endpoint: server.uri(),
        publisher_endpoint: server.uri(),
        store_endpoint: server.uri(),
        ..ApimConfig::default()
    };
    let invoker = Invoker::with_client(
        reqwest::Client::new(),
        RetryConfig {
            max_retries: 1,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            retry_on: is_error_response,
        },
    );
    ApimClient::new(
        ApimEndpoints::new(&config).expect("endpoints"),
        invoker,
        Arc::new(StaticToken),
    )
}

pub fn broker(server: &MockServer, store: Arc<dyn Store>) -> Broker {
    Broker::new(apim_client(server), store)
}

pub fn api(name: &str) -> Api {
    Api::new(name, "v1")
}

pub fn spec(names: &[&str]) -> DesiredSpec {
    DesiredSpec::new(names.iter().map(|n| api(n)))
}

pub fn ctx() -> PlatformContext {
    PlatformContext {
        org_id: "org-1".into(),
        space_id: "space-1".into(),
    }
}

/// Record an instance subscribed to `names` as if it had been provisioned.
pub async fn seed_instance(store: &dyn Store, instance_id: &str, names: &[&str]) {
    let instance = ServiceInstance {
        id: instance_id.into(),
        application_id: "app-1".into(),
        application_name: format!("ServiceBroker_{}", instance_id),
        org_id: "org-1".into(),
        space_id: "space-1".into(),
        consumer_key: "ck".into(),
        consumer_secret: "cs".into(),
        parameter_hash: fingerprint(&spec(names), "org-1", "space-1"),
    };
    store.insert_instance(&instance).await.expect("seed instance");

    let subscriptions: Vec<Subscription> = names
        .iter()
        .map(|n| Subscription {
            id: format!("sub-{}", n),
            application_id: "app-1".into(),
            api_name: n.to_string(),
            api_version: "v1".into(),
            user: "admin".into(),
            instance_id: instance_id.into(),
        })
        .collect();
    store
        .insert_subscriptions(&subscriptions)
        .await
        .expect("seed subscriptions");
}

pub async fn recorded_apis(store: &dyn Store, instance_id: &str) -> Vec<String> {
    let mut names: Vec<String> = store
        .list_subscriptions(instance_id)
        .await
        .expect("list subscriptions")
        .into_iter()
        .map(|s| s.api_name)
        .collect();
    names.sort();
    names
}

pub async fn mount_api_search(server: &MockServer, name: &str) {
    Mock::given(method("GET"))
        .and(path(PUBLISHER_APIS))
        .and(query_param("query", format!("name:{} version:v1", name).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 1,
            "list": [{"id": format!("api-{}", name), "name": name, "version": "v1", "provider": "admin"}]
        })))
        .mount(server)
        .await;
}

pub async fn mount_create_application(server: &MockServer, application_id: &str) {
    Mock::given(method("POST"))
        .and(path(APPLICATIONS))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"applicationId": application_id})),
        )
        .expect(1)
        .mount(server)
        .await;
}

pub async fn mount_generate_keys(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(GENERATE_KEYS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "consumerKey": "consumer-key",
            "consumerSecret": "consumer-secret",
            "keyType": "PRODUCTION"
        })))
        .mount(server)
        .await;
}

/// Multiple-subscription call answering one subscription per API name.
pub async fn mount_create_subscriptions(server: &MockServer, application_id: &str, names: &[&str]) {
    let body: Vec<_> = names
        .iter()
        .map(|n| {
            json!({
                "subscriptionId": format!("sub-{}", n),
                "applicationId": application_id,
                "apiIdentifier": format!("admin-{}-v1", n),
                "tier": "Unlimited",
                "status": "UNBLOCKED"
            })
        })
        .collect();
    Mock::given(method("POST"))
        .and(path(MULTIPLE_SUBSCRIPTIONS))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(server)
        .await;
}

pub async fn mount_unsubscribe(server: &MockServer, subscription_id: &str, status: u16, times: u64) {
    Mock::given(method("DELETE"))
        .and(path(format!("{}/{}", SUBSCRIPTIONS, subscription_id)))
        .respond_with(ResponseTemplate::new(status))
        .expect(times)
        .mount(server)
        .await;
}

pub async fn mount_delete_application(server: &MockServer, application_id: &str, status: u16, times: u64) {
    Mock::given(method("DELETE"))
        .and(path(format!("{}/{}", APPLICATIONS, application_id)))
        .respond_with(ResponseTemplate::new(status))
        .expect(times)
        .mount(server)
        .await;
}

/// Method and path of every mutating request the server saw, in order.
pub async fn mutations(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() != "GET")
        .map(|r| format!("{} {}", r.method, r.url.path()))
        .collect()
}
