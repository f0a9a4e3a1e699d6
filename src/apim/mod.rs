//! Client for the API Manager store and publisher REST APIs.
//!
//! Every operation fetches a bearer token from the shared [`TokenSource`] and goes
//! through the [`Invoker`], so retries and status classification are uniform.
//! Searches must resolve to exactly one resource; zero or several matches are
//! reported as distinct [`LookupError`]s before any mutation happens.

pub mod models;

use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

use crate::client::{construct_url, with_segment, Auth, Invoker, RequestBody};
use crate::config::ApimConfig;
use crate::errors::{ApimError, InvokeError, LookupError};
use crate::models::{Api, Subscription};
use crate::token::{TokenSource, TokenSettings};
use models::*;

const CONTEXT_CREATE_APPLICATION: &str = "create application";
const CONTEXT_GENERATE_KEYS: &str = "generate application keys";
const CONTEXT_CREATE_SUBSCRIPTIONS: &str = "create multiple subscriptions";
const CONTEXT_UNSUBSCRIBE: &str = "unsubscribe";
const CONTEXT_DELETE_APPLICATION: &str = "delete application";
const CONTEXT_SEARCH_API: &str = "search API";
const CONTEXT_SEARCH_APPLICATION: &str = "search application";

const DASHBOARD_PATH: &str = "/store/site/pages/application.jag";
const TOKEN_PATH: &str = "/token";

/// Fully joined endpoint URLs, built once at start-up.
#[derive(Debug, Clone)]
pub struct ApimEndpoints {
    pub registration: Url,
    pub token: Url,
    pub publisher_apis: Url,
    pub store_applications: Url,
    pub store_subscriptions: Url,
    pub store_multiple_subscriptions: Url,
    pub generate_keys: Url,
    pub dashboard: Url,
}

impl ApimEndpoints {
    pub fn new(config: &ApimConfig) -> Result<Self, InvokeError> {
        Ok(Self {
            registration: construct_url(
                &config.dynamic_client_endpoint,
                &config.dynamic_client_registration_context,
            )?,
            token: construct_url(&config.token_endpoint, TOKEN_PATH)?,
            publisher_apis: construct_url(&config.publisher_endpoint, &config.publisher_api_context)?,
            store_applications: construct_url(
                &config.store_endpoint,
                &config.store_application_context,
            )?,
            store_subscriptions: construct_url(
                &config.store_endpoint,
                &config.store_subscription_context,
            )?,
            store_multiple_subscriptions: construct_url(
                &config.store_endpoint,
                &config.store_multiple_subscription_context,
            )?,
            generate_keys: construct_url(
                &config.store_endpoint,
                &config.generate_application_key_context,
            )?,
            dashboard: construct_url(&config.store_endpoint, DASHBOARD_PATH)?,
        })
    }

    /// Settings for the token manager that authenticates against these endpoints.
    pub fn token_settings(&self, config: &ApimConfig) -> TokenSettings {
        TokenSettings {
            registration_url: self.registration.clone(),
            token_url: self.token.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            scopes: config.scopes.clone(),
        }
    }
}

/// An API resolved to its remote identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApi {
    pub api: Api,
    pub id: String,
    pub provider: String,
}

#[derive(Clone)]
pub struct ApimClient {
    endpoints: ApimEndpoints,
    invoker: Invoker,
    tokens: Arc<dyn TokenSource>,
}

impl ApimClient {
    pub fn new(endpoints: ApimEndpoints, invoker: Invoker, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            endpoints,
            invoker,
            tokens,
        }
    }

    /// Create an application and return its id.
    #[instrument(skip(self))]
    pub async fn create_application(&self, name: &str) -> Result<String, ApimError> {
        let request = ApplicationCreateRequest {
            throttling_tier: UNLIMITED_TIER.into(),
            description: format!("Application {} created by WSO2 APIM Service Broker", name),
            name: name.into(),
            callback_url: String::new(),
        };
        let body = RequestBody::json(CONTEXT_CREATE_APPLICATION, &request)?;
        let token = self.tokens.token().await?;

        let resp: ApplicationCreateResponse = self
            .invoker
            .invoke(
                CONTEXT_CREATE_APPLICATION,
                Method::POST,
                &self.endpoints.store_applications,
                Auth::Bearer(&token),
                Some(&body),
                StatusCode::CREATED,
            )
            .await?;
        debug!(application_id = %resp.application_id, "created application");
        Ok(resp.application_id)
    }

    #[instrument(skip(self))]
    pub async fn generate_keys(&self, application_id: &str) -> Result<ApplicationKeys, ApimError> {
        let body = RequestBody::json(CONTEXT_GENERATE_KEYS, &KeyGenerateRequest::default())?;
        let mut url = self.endpoints.generate_keys.clone();
        url.query_pairs_mut()
            .append_pair("applicationId", application_id);
        let token = self.tokens.token().await?;

        let keys = self
            .invoker
            .invoke(
                CONTEXT_GENERATE_KEYS,
                Method::POST,
                &url,
                Auth::Bearer(&token),
                Some(&body),
                StatusCode::OK,
            )
            .await?;
        Ok(keys)
    }

    /// Subscribe an application to every resolved API in one call.
    #[instrument(skip(self, apis), fields(count = apis.len()))]
    pub async fn create_subscriptions(
        &self,
        application_id: &str,
        apis: &[ResolvedApi],
    ) -> Result<Vec<SubscriptionResponse>, ApimError> {
        let requests: Vec<SubscriptionRequest> = apis
            .iter()
            .map(|api| SubscriptionRequest {
                tier: UNLIMITED_TIER.into(),
                api_identifier: api.id.clone(),
                application_id: application_id.to_string(),
            })
            .collect();
        let body = RequestBody::json(CONTEXT_CREATE_SUBSCRIPTIONS, &requests)?;
        let token = self.tokens.token().await?;

        let created = self
            .invoker
            .invoke(
                CONTEXT_CREATE_SUBSCRIPTIONS,
                Method::POST,
                &self.endpoints.store_multiple_subscriptions,
                Auth::Bearer(&token),
                Some(&body),
                StatusCode::OK,
            )
            .await?;
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ApimError> {
        let url = with_segment(&self.endpoints.store_subscriptions, subscription_id)?;
        self.delete(CONTEXT_UNSUBSCRIBE, &url).await
    }

    #[instrument(skip(self))]
    pub async fn delete_application(&self, application_id: &str) -> Result<(), ApimError> {
        let url = with_segment(&self.endpoints.store_applications, application_id)?;
        self.delete(CONTEXT_DELETE_APPLICATION, &url).await
    }

    /// Resolve an API by name and version to its id.
    #[instrument(skip(self), fields(api = %api))]
    pub async fn search_api(&self, api: &Api) -> Result<ResolvedApi, ApimError> {
        let query = format!("name:{} version:{}", api.name, api.version);
        let resp: SearchResponse<ApiSearchInfo> = self
            .search(CONTEXT_SEARCH_API, &self.endpoints.publisher_apis, &query)
            .await?;
        let info = single(resp, "API", &api.name)?;
        Ok(ResolvedApi {
            api: api.clone(),
            id: info.id,
            provider: info.provider,
        })
    }

    /// Resolve every API, stopping at the first failure.
    pub async fn resolve_apis<'a, I>(&self, apis: I) -> Result<Vec<ResolvedApi>, ApimError>
    where
        I: IntoIterator<Item = &'a Api>,
    {
        let mut resolved = Vec::new();
        for api in apis {
            resolved.push(self.search_api(api).await?);
        }
        Ok(resolved)
    }

    /// Resolve an application by name to its id.
    #[instrument(skip(self))]
    pub async fn search_application(&self, name: &str) -> Result<String, ApimError> {
        let resp: SearchResponse<ApplicationSearchInfo> = self
            .search(CONTEXT_SEARCH_APPLICATION, &self.endpoints.store_applications, name)
            .await?;
        Ok(single(resp, "application", name)?.application_id)
    }

    pub fn dashboard_url(&self, application_name: &str) -> String {
        let mut url = self.endpoints.dashboard.clone();
        url.query_pairs_mut().append_pair("name", application_name);
        url.to_string()
    }

    async fn search<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        endpoint: &Url,
        query: &str,
    ) -> Result<SearchResponse<T>, ApimError> {
        let mut url = endpoint.clone();
        url.query_pairs_mut().append_pair("query", query);
        let token = self.tokens.token().await?;
        let resp = self
            .invoker
            .invoke(
                context,
                Method::GET,
                &url,
                Auth::Bearer(&token),
                None,
                StatusCode::OK,
            )
            .await?;
        Ok(resp)
    }

    async fn delete(&self, context: &str, url: &Url) -> Result<(), ApimError> {
        let token = self.tokens.token().await?;
        self.invoker
            .invoke_no_content(
                context,
                Method::DELETE,
                url,
                Auth::Bearer(&token),
                None,
                StatusCode::OK,
            )
            .await?;
        Ok(())
    }
}

fn single<T>(resp: SearchResponse<T>, kind: &'static str, name: &str) -> Result<T, LookupError> {
    let count = resp.count.max(resp.list.len());
    match (count, resp.list.into_iter().next()) {
        (0, _) | (_, None) => Err(LookupError::NotFound {
            kind,
            name: name.to_string(),
        }),
        (1, Some(item)) => Ok(item),
        (count, Some(_)) => Err(LookupError::Ambiguous {
            kind,
            name: name.to_string(),
            count,
        }),
    }
}

/// Turn created subscriptions into records for an instance.
///
/// The platform identifies the subscribed API as `provider-name-version`; each
/// response is matched back to the requested API by id or by that suffix, and
/// the provider becomes the recorded user. Every requested API must be answered
/// by exactly one subscription.
pub fn subscription_records(
    instance_id: &str,
    requested: &[ResolvedApi],
    created: &[SubscriptionResponse],
) -> Result<Vec<Subscription>, LookupError> {
    let mut answered = vec![0usize; requested.len()];
    let mut records = Vec::with_capacity(created.len());

    for resp in created {
        let index = requested
            .iter()
            .position(|r| {
                r.id == resp.api_identifier
                    || resp
                        .api_identifier
                        .ends_with(&format!("-{}-{}", r.api.name, r.api.version))
            })
            .ok_or_else(|| LookupError::NotFound {
                kind: "subscribed API",
                name: resp.api_identifier.clone(),
            })?;
        answered[index] += 1;

        let resolved = &requested[index];
        let suffix = format!("-{}-{}", resolved.api.name, resolved.api.version);
        let user = match resp.api_identifier.strip_suffix(&suffix) {
            Some(provider) if !provider.is_empty() => provider.to_string(),
            _ => resolved.provider.clone(),
        };

        records.push(Subscription {
            id: resp.subscription_id.clone(),
            application_id: resp.application_id.clone(),
            api_name: resolved.api.name.clone(),
            api_version: resolved.api.version.clone(),
            user,
            instance_id: instance_id.to_string(),
        });
    }

    for (resolved, count) in requested.iter().zip(answered) {
        match count {
            1 => {}
            0 => {
                return Err(LookupError::NotFound {
                    kind: "subscription for API",
                    name: resolved.api.to_string(),
                })
            }
            count => {
                return Err(LookupError::Ambiguous {
                    kind: "subscription for API",
                    name: resolved.api.to_string(),
                    count,
                })
            }
        }
    }
    Ok(records)
}
