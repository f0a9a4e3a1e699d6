use serde::Deserialize;
use std::str::FromStr;

/// Environment variable naming an optional YAML configuration file.
pub const CONF_FILE_ENV: &str = "APIM_BROKER_CONF_FILE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub apim: ApimConfig,
    /// Postgres URL. When unset the broker keeps its records in memory.
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub auth: BasicAuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeout_secs: u64,
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_retries: u32,
    /// Skip TLS certificate verification (API Manager ships self-signed certs).
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApimConfig {
    pub username: String,
    pub password: String,
    pub token_endpoint: String,
    pub dynamic_client_endpoint: String,
    pub dynamic_client_registration_context: String,
    pub publisher_endpoint: String,
    pub publisher_api_context: String,
    pub store_endpoint: String,
    pub store_application_context: String,
    pub store_subscription_context: String,
    pub store_multiple_subscription_context: String,
    pub generate_application_key_context: String,
    pub scopes: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8444,
            auth: BasicAuthConfig::default(),
        }
    }
}

impl Default for BasicAuthConfig {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: "admin".into(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            min_backoff_secs: 1,
            max_backoff_secs: 60,
            max_retries: 3,
            insecure: true,
        }
    }
}

impl Default for ApimConfig {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: "admin".into(),
            token_endpoint: "https://localhost:8243".into(),
            dynamic_client_endpoint: "https://localhost:9443".into(),
            dynamic_client_registration_context: "/client-registration/v0.14/register".into(),
            publisher_endpoint: "https://localhost:9443".into(),
            publisher_api_context: "/api/am/publisher/v0.14/apis".into(),
            store_endpoint: "https://localhost:9443".into(),
            store_application_context: "/api/am/store/v0.14/applications".into(),
            store_subscription_context: "/api/am/store/v0.14/subscriptions".into(),
            store_multiple_subscription_context: "/api/am/store/v0.14/subscriptions/multiple"
                .into(),
            generate_application_key_context: "/api/am/store/v0.14/applications/generate-keys"
                .into(),
            scopes: vec!["apim:subscribe".into(), "apim:api_view".into()],
        }
    }
}

/// Load configuration: defaults, then the YAML file named by
/// `APIM_BROKER_CONF_FILE` (if any), then `APIM_BROKER_*` environment overrides.
pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let mut config = match std::env::var(CONF_FILE_ENV) {
        Ok(path) => {
            eprintln!("loading the configuration file: {}", path);
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("unable to read configuration {}: {}", path, e))?;
            from_yaml(&raw)?
        }
        Err(_) => Config::default(),
    };

    apply_env(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

pub fn from_yaml(raw: &str) -> anyhow::Result<Config> {
    serde_yaml::from_str(raw).map_err(|e| anyhow::anyhow!("unable to parse configuration: {}", e))
}

fn apply_env<F>(config: &mut Config, lookup: F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let string = |target: &mut String, key: &str| {
        if let Some(v) = lookup(key) {
            *target = v;
        }
    };

    string(&mut config.log.level, "APIM_BROKER_LOG_LEVEL");
    string(&mut config.log.format, "APIM_BROKER_LOG_FORMAT");

    string(&mut config.server.host, "APIM_BROKER_SERVER_HOST");
    parse_into(&mut config.server.port, "APIM_BROKER_SERVER_PORT", &lookup)?;
    string(&mut config.server.auth.username, "APIM_BROKER_SERVER_AUTH_USERNAME");
    string(&mut config.server.auth.password, "APIM_BROKER_SERVER_AUTH_PASSWORD");

    parse_into(&mut config.client.timeout_secs, "APIM_BROKER_CLIENT_TIMEOUT", &lookup)?;
    parse_into(&mut config.client.min_backoff_secs, "APIM_BROKER_CLIENT_MIN_BACKOFF", &lookup)?;
    parse_into(&mut config.client.max_backoff_secs, "APIM_BROKER_CLIENT_MAX_BACKOFF", &lookup)?;
    parse_into(&mut config.client.max_retries, "APIM_BROKER_CLIENT_MAX_RETRIES", &lookup)?;
    parse_into(&mut config.client.insecure, "APIM_BROKER_CLIENT_INSECURE", &lookup)?;

    let apim = &mut config.apim;
    string(&mut apim.username, "APIM_BROKER_APIM_USERNAME");
    string(&mut apim.password, "APIM_BROKER_APIM_PASSWORD");
    string(&mut apim.token_endpoint, "APIM_BROKER_APIM_TOKEN_ENDPOINT");
    string(&mut apim.dynamic_client_endpoint, "APIM_BROKER_APIM_DYNAMIC_CLIENT_ENDPOINT");
    string(
        &mut apim.dynamic_client_registration_context,
        "APIM_BROKER_APIM_DYNAMIC_CLIENT_REGISTRATION_CONTEXT",
    );
    string(&mut apim.publisher_endpoint, "APIM_BROKER_APIM_PUBLISHER_ENDPOINT");
    string(&mut apim.publisher_api_context, "APIM_BROKER_APIM_PUBLISHER_API_CONTEXT");
    string(&mut apim.store_endpoint, "APIM_BROKER_APIM_STORE_ENDPOINT");
    string(&mut apim.store_application_context, "APIM_BROKER_APIM_STORE_APPLICATION_CONTEXT");
    string(&mut apim.store_subscription_context, "APIM_BROKER_APIM_STORE_SUBSCRIPTION_CONTEXT");
    string(
        &mut apim.store_multiple_subscription_context,
        "APIM_BROKER_APIM_STORE_MULTIPLE_SUBSCRIPTION_CONTEXT",
    );
    string(
        &mut apim.generate_application_key_context,
        "APIM_BROKER_APIM_GENERATE_APPLICATION_KEY_CONTEXT",
    );
    if let Some(scopes) = lookup("APIM_BROKER_APIM_SCOPES") {
        apim.scopes = scopes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }

    if let Some(url) = lookup("DATABASE_URL").or_else(|| lookup("APIM_BROKER_DATABASE_URL")) {
        config.database_url = Some(url);
    }

    Ok(())
}

fn parse_into<T, F>(target: &mut T, key: &str, lookup: &F) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e))?;
    }
    Ok(())
}
