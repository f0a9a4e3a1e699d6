use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failure of a single remote invocation, after retries.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// No response was received (connection refused, DNS, timeout).
    #[error("unable to initiate request: {context}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("remote resource conflict: {context} URL: {url}")]
    Conflict { context: String, url: String },

    #[error("remote resource not found: {context} URL: {url}")]
    NotFound { context: String, url: String },

    #[error("unsuccessful API call: {context} response code: {status} URL: {url}")]
    Unsuccessful {
        context: String,
        status: StatusCode,
        url: String,
    },

    #[error("unable to parse response body, context: {context}")]
    Decode {
        context: String,
        status: StatusCode,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to encode request body, context: {context}")]
    Encode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("credential cannot be sent as a header, context: {context}")]
    InvalidCredential { context: String },
}

impl InvokeError {
    /// Status code observed on the last attempt, if a response arrived.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            InvokeError::Conflict { .. } => Some(StatusCode::CONFLICT),
            InvokeError::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            InvokeError::Unsuccessful { status, .. } | InvokeError::Decode { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, InvokeError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, InvokeError::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("unable to register the broker client")]
    Registration(#[source] InvokeError),

    #[error("unable to get access token for scopes {scopes:?}")]
    Grant {
        scopes: Vec<String>,
        #[source]
        source: InvokeError,
    },

    #[error("unable to refresh the access token")]
    Refresh(#[source] InvokeError),

    #[error("at least one scope should be present")]
    NoScopes,
}

/// A search that must resolve to exactly one remote resource did not.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("couldn't find the {kind} {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("returned {count} results for {kind} {name}")]
    Ambiguous {
        kind: &'static str,
        name: String,
        count: usize,
    },
}

/// Failure of a remote platform operation: no token, a failed call, or a search
/// that did not resolve to exactly one resource.
#[derive(Debug, Error)]
pub enum ApimError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl ApimError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApimError::Invoke(e) if e.is_conflict())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApimError::Invoke(e) if e.is_not_found())
    }
}

/// Tag used by callers to translate a failure into a marketplace response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Conflict,
    NotFound,
    Gone,
    BadRequest,
    Failure,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("instance {instance_id} already exists with different attributes")]
    Conflict { instance_id: String },

    #[error("instance {instance_id} does not exist")]
    InstanceNotFound { instance_id: String },

    #[error("binding {binding_id} does not exist")]
    BindingNotFound { binding_id: String },

    #[error("binding {binding_id} already exists with different attributes")]
    BindingConflict { binding_id: String },

    #[error("remote resource {name} already exists")]
    RemoteResourceExists {
        name: String,
        remote_id: Option<String>,
    },

    #[error("no subscription recorded for API {api} on application {application_id}")]
    SubscriptionNotFound { application_id: String, api: String },

    #[error("lookup failed: {0}")]
    Lookup(#[from] LookupError),

    #[error("unable to {action}")]
    Remote {
        action: &'static str,
        #[source]
        source: InvokeError,
    },

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("unable to {action}")]
    Persistence {
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl BrokerError {
    /// Wrap a remote failure, keeping token and lookup failures as their own variants.
    pub fn remote(action: &'static str) -> impl FnOnce(ApimError) -> BrokerError {
        move |err| match err {
            ApimError::Invoke(source) => BrokerError::Remote { action, source },
            ApimError::Token(e) => BrokerError::Token(e),
            ApimError::Lookup(e) => BrokerError::Lookup(e),
        }
    }

    pub fn persistence(action: &'static str) -> impl FnOnce(anyhow::Error) -> BrokerError {
        move |source| BrokerError::Persistence { action, source }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            BrokerError::InvalidParameters(_) => OutcomeKind::BadRequest,
            BrokerError::Conflict { .. }
            | BrokerError::BindingConflict { .. }
            | BrokerError::RemoteResourceExists { .. } => OutcomeKind::Conflict,
            BrokerError::InstanceNotFound { .. } => OutcomeKind::NotFound,
            BrokerError::BindingNotFound { .. } => OutcomeKind::Gone,
            _ => OutcomeKind::Failure,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let (status, code, msg) = match self.kind() {
            OutcomeKind::BadRequest => (StatusCode::BAD_REQUEST, "bad_request", self.to_string()),
            OutcomeKind::Conflict => (StatusCode::CONFLICT, "conflict", self.to_string()),
            OutcomeKind::NotFound => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            OutcomeKind::Gone => (StatusCode::GONE, "gone", self.to_string()),
            OutcomeKind::Failure => {
                tracing::error!(error = ?self, "broker operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    self.to_string(),
                )
            }
        };

        (
            status,
            Json(json!({
                "error": code,
                "description": msg,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_error_exposes_status() {
        let err = InvokeError::Conflict {
            context: "create application".into(),
            url: "http://apim/applications".into(),
        };
        assert!(err.is_conflict());
        assert_eq!(err.status(), Some(StatusCode::CONFLICT));

        let err = InvokeError::Unsuccessful {
            context: "search API".into(),
            status: StatusCode::BAD_GATEWAY,
            url: "http://apim/apis".into(),
        };
        assert!(!err.is_not_found());
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn test_outcome_kind_mapping() {
        let conflict = BrokerError::Conflict {
            instance_id: "i-1".into(),
        };
        assert_eq!(conflict.kind(), OutcomeKind::Conflict);
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let gone = BrokerError::BindingNotFound {
            binding_id: "b-1".into(),
        };
        assert_eq!(gone.into_response().status(), StatusCode::GONE);

        let lookup = BrokerError::from(LookupError::Ambiguous {
            kind: "API",
            name: "orders".into(),
            count: 2,
        });
        assert_eq!(lookup.kind(), OutcomeKind::Failure);
    }

    #[test]
    fn test_remote_keeps_lookup_variant() {
        let err = BrokerError::remote("search API")(ApimError::Lookup(LookupError::NotFound {
            kind: "API",
            name: "orders".into(),
        }));
        assert!(matches!(err, BrokerError::Lookup(LookupError::NotFound { .. })));

        let err = BrokerError::remote("create application")(ApimError::Invoke(
            InvokeError::Conflict {
                context: "create application".into(),
                url: "http://apim/applications".into(),
            },
        ));
        assert!(matches!(
            err,
            BrokerError::Remote {
                action: "create application",
                ..
            }
        ));
    }
}
