//! Access-token lifecycle for the remote platform.
//!
//! The broker registers itself once as an OAuth client, obtains a password grant,
//! and from then on hands out the cached access token. A token within
//! [`EXPIRY_SKEW_SECS`] of expiry is refreshed with the refresh-token grant; the
//! refresh happens under the write lock after a second expiry check, so concurrent
//! callers observing the same expiry trigger exactly one exchange.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use url::Url;

use crate::client::{Auth, Invoker, RequestBody};
use crate::errors::{InvokeError, TokenError};

/// Margin before actual expiry at which a token is treated as expired.
pub const EXPIRY_SKEW_SECS: i64 = 10;

const CONTEXT_REGISTER: &str = "dynamic client registration";
const CONTEXT_GRANT: &str = "generate access token";
const CONTEXT_REFRESH: &str = "refresh access token";

const CLIENT_NAME: &str = "apim_service_broker";
const CALLBACK_URL: &str = "www.dummy.com";
const REGISTRATION_GRANT_TYPES: &str = "password refresh_token";

/// Anything that can hand out a currently valid bearer token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, TokenError>;
}

/// Where and as whom the broker authenticates.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub registration_url: Url,
    pub token_url: Url,
    pub username: String,
    pub password: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientRegistrationRequest<'a> {
    callback_url: &'a str,
    client_name: &'a str,
    owner: &'a str,
    grant_type: &'a str,
    saas_app: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientRegistrationResponse {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Clone)]
struct Credential {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    fn from_response(resp: TokenResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: Utc::now() + Duration::seconds(resp.expires_in),
        }
    }

    /// True if the token is expired or will expire within the skew window.
    fn is_expired(&self) -> bool {
        Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) >= self.expires_at
    }
}

/// Password + refresh-token grant manager holding the process-wide credential.
pub struct TokenManager {
    invoker: Invoker,
    token_url: Url,
    client: ClientCredentials,
    credential: RwLock<Credential>,
}

impl TokenManager {
    /// Register the broker client and obtain the first token.
    ///
    /// There is no useful operating mode without a credential, so the caller is
    /// expected to abort start-up on error.
    #[instrument(skip_all, fields(token_url = %settings.token_url))]
    pub async fn init(invoker: Invoker, settings: TokenSettings) -> Result<Self, TokenError> {
        if settings.scopes.is_empty() {
            return Err(TokenError::NoScopes);
        }

        let client = register_client(&invoker, &settings).await?;

        let scope = settings.scopes.join(" ");
        let body = RequestBody::form(&[
            ("username", settings.username.as_str()),
            ("password", settings.password.as_str()),
            ("grant_type", "password"),
            ("scope", scope.as_str()),
        ]);
        let resp = request_token(&invoker, &settings.token_url, &client, &body, CONTEXT_GRANT)
            .await
            .map_err(|source| TokenError::Grant {
                scopes: settings.scopes.clone(),
                source,
            })?;

        let credential = Credential::from_response(resp);
        info!(
            scopes = %scope,
            expires_at = %credential.expires_at,
            "generated access token"
        );

        Ok(Self {
            invoker,
            token_url: settings.token_url,
            client,
            credential: RwLock::new(credential),
        })
    }

    /// Return a valid access token, refreshing it if it is inside the skew window.
    pub async fn token(&self) -> Result<String, TokenError> {
        {
            let credential = self.credential.read().await;
            if !credential.is_expired() {
                return Ok(credential.access_token.clone());
            }
        }

        let mut credential = self.credential.write().await;
        // Another caller may have refreshed while we waited for the write lock.
        if !credential.is_expired() {
            debug!("access token already refreshed");
            return Ok(credential.access_token.clone());
        }

        debug!(expires_at = %credential.expires_at, "access token is expired, re-generating");
        let body = RequestBody::form(&[
            ("refresh_token", credential.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ]);
        let resp = request_token(
            &self.invoker,
            &self.token_url,
            &self.client,
            &body,
            CONTEXT_REFRESH,
        )
        .await
        .map_err(TokenError::Refresh)?;

        *credential = Credential::from_response(resp);
        debug!(expires_at = %credential.expires_at, "new access token is generated");
        Ok(credential.access_token.clone())
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn token(&self) -> Result<String, TokenError> {
        TokenManager::token(self).await
    }
}

async fn register_client(
    invoker: &Invoker,
    settings: &TokenSettings,
) -> Result<ClientCredentials, TokenError> {
    let request = ClientRegistrationRequest {
        callback_url: CALLBACK_URL,
        client_name: CLIENT_NAME,
        owner: &settings.username,
        grant_type: REGISTRATION_GRANT_TYPES,
        saas_app: true,
    };
    let body = RequestBody::json(CONTEXT_REGISTER, &request).map_err(TokenError::Registration)?;

    let resp: ClientRegistrationResponse = invoker
        .invoke(
            CONTEXT_REGISTER,
            Method::POST,
            &settings.registration_url,
            Auth::Basic {
                username: &settings.username,
                password: &settings.password,
            },
            Some(&body),
            StatusCode::OK,
        )
        .await
        .map_err(TokenError::Registration)?;

    debug!(client_id = %resp.client_id, "registered broker client");
    Ok(ClientCredentials {
        client_id: resp.client_id,
        client_secret: resp.client_secret,
    })
}

async fn request_token(
    invoker: &Invoker,
    token_url: &Url,
    client: &ClientCredentials,
    body: &RequestBody,
    context: &str,
) -> Result<TokenResponse, InvokeError> {
    invoker
        .invoke(
            context,
            Method::POST,
            token_url,
            Auth::Basic {
                username: &client.client_id,
                password: &client.client_secret,
            },
            Some(body),
            StatusCode::OK,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{is_error_response, RetryConfig};
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn invoker() -> Invoker {
        Invoker::with_client(
            reqwest::Client::new(),
            RetryConfig {
                max_retries: 1,
                min_backoff: StdDuration::ZERO,
                max_backoff: StdDuration::ZERO,
                retry_on: is_error_response,
            },
        )
    }

    fn settings(server: &MockServer) -> TokenSettings {
        TokenSettings {
            registration_url: Url::parse(&format!("{}/client-registration/register", server.uri()))
                .unwrap(),
            token_url: Url::parse(&format!("{}/token", server.uri())).unwrap(),
            username: "admin".into(),
            password: "admin".into(),
            scopes: vec!["apim:subscribe".into(), "apim:api_view".into()],
        }
    }

    async fn mount_registration(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/client-registration/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "clientId": "client-id",
                "clientSecret": "client-secret",
                "clientName": "apim_service_broker"
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn mount_password_grant(server: &MockServer, expires_in: i64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("scope=apim%3Asubscribe+apim%3Aapi_view"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "initial-access",
                "refresh_token": "initial-refresh",
                "expires_in": expires_in,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_init_registers_and_caches_token() {
        let server = MockServer::start().await;
        mount_registration(&server).await;
        mount_password_grant(&server, 3600).await;

        let manager = TokenManager::init(invoker(), settings(&server)).await.unwrap();

        assert_eq!(manager.token().await.unwrap(), "initial-access");
        assert_eq!(manager.token().await.unwrap(), "initial-access");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_expiry_triggers_single_refresh() {
        let server = MockServer::start().await;
        mount_registration(&server).await;
        // Five seconds left is inside the ten second skew window.
        mount_password_grant(&server, 5).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=initial-refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "access_token": "refreshed-access",
                        "refresh_token": "refreshed-refresh",
                        "expires_in": 3600
                    }))
                    .set_delay(StdDuration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let manager = Arc::new(TokenManager::init(invoker(), settings(&server)).await.unwrap());

        let handles = (0..16).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.token().await })
        });
        let tokens = join_all(handles).await;

        for token in tokens {
            assert_eq!(token.unwrap().unwrap(), "refreshed-access");
        }
    }

    #[tokio::test]
    async fn test_refresh_failure_is_surfaced_and_retried_next_call() {
        let server = MockServer::start().await;
        mount_registration(&server).await;
        mount_password_grant(&server, 0).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "second-try",
                "refresh_token": "r2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = TokenManager::init(invoker(), settings(&server)).await.unwrap();

        let err = manager.token().await.unwrap_err();
        assert!(matches!(err, TokenError::Refresh(_)));
        assert_eq!(manager.token().await.unwrap(), "second-try");
    }

    #[tokio::test]
    async fn test_registration_failure_aborts_init() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/client-registration/register"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = TokenManager::init(invoker(), settings(&server))
            .await
            .err()
            .expect("init must fail");
        assert!(matches!(err, TokenError::Registration(_)));
    }

    #[tokio::test]
    async fn test_init_requires_scopes() {
        let server = MockServer::start().await;
        let mut settings = settings(&server);
        settings.scopes.clear();

        let err = TokenManager::init(invoker(), settings).await.err().unwrap();
        assert!(matches!(err, TokenError::NoScopes));
    }

    #[test]
    fn test_credential_skew_window() {
        let credential = |secs: i64| Credential {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now() + Duration::seconds(secs),
        };
        assert!(credential(5).is_expired());
        assert!(credential(-30).is_expired());
        assert!(!credential(60).is_expired());
    }
}
