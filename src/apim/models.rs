//! Wire types of the API Manager store and publisher REST APIs.

use serde::{Deserialize, Serialize};

pub const UNLIMITED_TIER: &str = "Unlimited";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCreateRequest {
    pub throttling_tier: String,
    pub description: String,
    pub name: String,
    pub callback_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCreateResponse {
    pub application_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyGenerateRequest {
    pub key_type: String,
    pub validity_time: String,
    pub supported_grant_types: Vec<String>,
    pub access_allow_domains: Vec<String>,
    pub scopes: Vec<String>,
}

impl Default for KeyGenerateRequest {
    fn default() -> Self {
        Self {
            key_type: "PRODUCTION".into(),
            validity_time: "3600".into(),
            supported_grant_types: vec![
                "urn:ietf:params:oauth:grant-type:saml2-bearer".into(),
                "iwa:ntlm".into(),
                "refresh_token".into(),
                "client_credentials".into(),
                "password".into(),
            ],
            access_allow_domains: vec!["ALL".into()],
            scopes: vec!["am_application_scope".into(), "default".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationKeys {
    pub consumer_key: String,
    pub consumer_secret: String,
    #[serde(default)]
    pub key_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub tier: String,
    pub api_identifier: String,
    pub application_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub subscription_id: String,
    pub application_id: String,
    pub api_identifier: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSearchInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSearchInfo {
    pub application_id: String,
    pub name: String,
    #[serde(default)]
    pub subscriber: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse<T> {
    pub count: usize,
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}
