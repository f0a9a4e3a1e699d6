//! Resilient invoker for the remote platform and its identity endpoint.
//!
//! Every call goes through [`Invoker::invoke`]: the body is serialized once into
//! an immutable buffer, sent with the caller's credential, retried per
//! [`RetryConfig`], and the final response is classified into a typed
//! [`InvokeError`] unless it carries the expected status.

pub mod retry;

use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::config::ClientConfig;
use crate::errors::InvokeError;
pub use retry::{calculate_backoff, is_error_response, RetryConfig, RetryPredicate};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

/// Join a base URL and a context path, e.g. `https://host:9443` + `/api/am/store/v0.14/apis`.
///
/// Slashes at the seam are normalized; any path already on the base is kept.
pub fn construct_url(base: &str, path: &str) -> Result<Url, InvokeError> {
    let mut url = Url::parse(base).map_err(|e| InvokeError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(InvokeError::InvalidUrl {
            url: base.to_string(),
            reason: "URL cannot be a base".into(),
        });
    }
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    Ok(url)
}

/// Append one escaped path segment (a resource id) to an endpoint.
pub fn with_segment(endpoint: &Url, segment: &str) -> Result<Url, InvokeError> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| InvokeError::InvalidUrl {
            url: endpoint.to_string(),
            reason: "URL cannot be a base".into(),
        })?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}

/// Credential attached to an outbound call.
#[derive(Debug, Clone, Copy)]
pub enum Auth<'a> {
    Bearer(&'a str),
    Basic { username: &'a str, password: &'a str },
}

impl Auth<'_> {
    fn header_value(&self, context: &str) -> Result<HeaderValue, InvokeError> {
        let raw = match self {
            Auth::Bearer(token) => format!("Bearer {}", token),
            Auth::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                format!("Basic {}", encoded)
            }
        };
        let mut value = HeaderValue::from_str(&raw).map_err(|_| InvokeError::InvalidCredential {
            context: context.to_string(),
        })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// A request body serialized once and replayed verbatim on every attempt.
#[derive(Debug, Clone)]
pub struct RequestBody {
    content_type: &'static str,
    bytes: Bytes,
}

impl RequestBody {
    pub fn json<T: Serialize + ?Sized>(context: &str, value: &T) -> Result<Self, InvokeError> {
        let bytes = serde_json::to_vec(value).map_err(|source| InvokeError::Encode {
            context: context.to_string(),
            source,
        })?;
        Ok(Self {
            content_type: CONTENT_TYPE_JSON,
            bytes: Bytes::from(bytes),
        })
    }

    pub fn form(pairs: &[(&str, &str)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        Self {
            content_type: CONTENT_TYPE_FORM,
            bytes: Bytes::from(encoded),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Clone)]
pub struct Invoker {
    client: Client,
    retry: RetryConfig,
}

impl Invoker {
    /// Build the HTTP client from configuration. Request-level timeout lives here;
    /// nothing bounds a whole sequence of calls.
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        let retry = RetryConfig {
            max_retries: config.max_retries,
            min_backoff: Duration::from_secs(config.min_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            retry_on: is_error_response,
        };

        Ok(Self { client, retry })
    }

    pub fn with_client(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Invoke and parse the JSON response body of the expected status into `T`.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        context: &str,
        method: Method,
        url: &Url,
        auth: Auth<'_>,
        body: Option<&RequestBody>,
        expected: StatusCode,
    ) -> Result<T, InvokeError> {
        let response = self.send(context, method, url, auth, body, expected).await?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|source| InvokeError::Transport {
                context: context.to_string(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| InvokeError::Decode {
            context: context.to_string(),
            status,
            source,
        })
    }

    /// Invoke and discard whatever body the expected status carries.
    pub async fn invoke_no_content(
        &self,
        context: &str,
        method: Method,
        url: &Url,
        auth: Auth<'_>,
        body: Option<&RequestBody>,
        expected: StatusCode,
    ) -> Result<(), InvokeError> {
        self.send(context, method, url, auth, body, expected).await?;
        Ok(())
    }

    async fn send(
        &self,
        context: &str,
        method: Method,
        url: &Url,
        auth: Auth<'_>,
        body: Option<&RequestBody>,
        expected: StatusCode,
    ) -> Result<Response, InvokeError> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth.header_value(context)?);
        if let Some(body) = body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(body.content_type));
        }

        let response = retry::robust_request(
            &self.client,
            method,
            url,
            headers,
            body.map(|b| b.bytes.clone()),
            &self.retry,
        )
        .await
        .map_err(|source| {
            tracing::warn!(context, %url, error = %source, "no response from remote endpoint");
            InvokeError::Transport {
                context: context.to_string(),
                source,
            }
        })?;

        let status = response.status();
        if status == expected {
            return Ok(response);
        }

        tracing::debug!(context, %url, %status, %expected, "unexpected response status");
        let context = context.to_string();
        let url = url.to_string();
        Err(match status {
            StatusCode::CONFLICT => InvokeError::Conflict { context, url },
            StatusCode::NOT_FOUND => InvokeError::NotFound { context, url },
            status => InvokeError::Unsuccessful {
                context,
                status,
                url,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct Created {
        #[serde(rename = "applicationId")]
        application_id: String,
    }

    fn invoker(max_retries: u32) -> Invoker {
        Invoker::with_client(
            Client::new(),
            RetryConfig {
                max_retries,
                min_backoff: Duration::ZERO,
                max_backoff: Duration::from_millis(5),
                retry_on: is_error_response,
            },
        )
    }

    #[test]
    fn test_form_body_is_url_encoded() {
        let body = RequestBody::form(&[("grant_type", "password"), ("scope", "a b")]);
        assert_eq!(body.as_bytes(), b"grant_type=password&scope=a+b");
    }

    #[test]
    fn test_construct_url_normalizes_slashes() {
        let url = construct_url("https://localhost:9443/", "/api/am/store/v0.14/applications").unwrap();
        assert_eq!(url.as_str(), "https://localhost:9443/api/am/store/v0.14/applications");

        let url = with_segment(&url, "app 1").unwrap();
        assert_eq!(url.as_str(), "https://localhost:9443/api/am/store/v0.14/applications/app%201");

        assert!(matches!(
            construct_url("not a url", "/x"),
            Err(InvokeError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_basic_auth_header() {
        let value = Auth::Basic {
            username: "admin",
            password: "admin",
        }
        .header_value("test")
        .unwrap();
        assert_eq!(value.to_str().unwrap(), "Basic YWRtaW46YWRtaW4=");
    }

    #[tokio::test]
    async fn test_invoke_parses_expected_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/applications"))
            .and(header("authorization", "Bearer tok"))
            .and(header("content-type", CONTENT_TYPE_JSON))
            .and(body_string(r#"{"name":"app"}"#))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"applicationId": "a-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/applications", server.uri())).unwrap();
        let body = RequestBody::json("create application", &json!({"name": "app"})).unwrap();
        let created: Created = invoker(3)
            .invoke(
                "create application",
                Method::POST,
                &url,
                Auth::Bearer("tok"),
                Some(&body),
                StatusCode::CREATED,
            )
            .await
            .unwrap();
        assert_eq!(created.application_id, "a-1");
    }

    #[tokio::test]
    async fn test_exhausted_conflict_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/applications"))
            .respond_with(ResponseTemplate::new(409))
            .expect(2)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/applications", server.uri())).unwrap();
        let err = invoker(2)
            .invoke_no_content(
                "create application",
                Method::POST,
                &url,
                Auth::Bearer("tok"),
                None,
                StatusCode::CREATED,
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unexpected_success_status_is_unsuccessful() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/applications/a-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/applications/a-1", server.uri())).unwrap();
        let err = invoker(3)
            .invoke_no_content(
                "delete application",
                Method::DELETE,
                &url,
                Auth::Bearer("tok"),
                None,
                StatusCode::OK,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NO_CONTENT));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/apis", server.uri())).unwrap();
        let err = invoker(1)
            .invoke::<Created>(
                "search API",
                Method::GET,
                &url,
                Auth::Bearer("tok"),
                None,
                StatusCode::OK,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Decode { .. }));
    }
}
