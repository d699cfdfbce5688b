// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    CAMERA_CHANNEL_PREFIX, DEFAULT_APPEND_ATTEMPTS, DEFAULT_APPEND_BACKOFF_BASE_MS,
    DEFAULT_APPEND_BACKOFF_MAX_MS, DEFAULT_BATCH_INTERVAL, DEFAULT_CAMERA_API_URL,
    DEFAULT_EVENTS_API_URL, DEFAULT_POSTGRES_TABLE, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SINK_TIMEOUT, DEFAULT_SLACK_API_URL, DEFAULT_SLACK_CHANNEL, DEFAULT_SLACK_IMAGES_PER_BATCH, DEFAULT_SLACK_STATUS_EVERY,
    DEFAULT_SOURCE_TIMEOUT, DEFAULT_SPEEDS_API_URL, DEFAULT_TOKEN_REFRESH_MARGIN,
    EVENTS_CHANNEL_PREFIX, SPEEDS_CHANNEL_PREFIX,
};
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryStrategy;

/// Values accepted from the JSON file named by `SNOWFLAKE_CONFIG_FILE`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    account: Option<String>,
    user: Option<String>,
    pat: Option<String>,
    refresh_token: Option<String>,
    oauth_client_id: Option<String>,
    oauth_client_secret: Option<String>,
    #[serde(alias = "private_key_file")]
    private_key_path: Option<String>,
    private_key_passphrase: Option<String>,
    database: Option<String>,
    schema: Option<String>,
    table: Option<String>,
    role: Option<String>,
    account_url: Option<String>,
    channel_name: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Programmatic access token; never expires.
    AccessToken(String),
    /// OAuth refresh-token grant producing expiring access tokens.
    RefreshToken {
        refresh_token: String,
        client_id: Option<String>,
        client_secret: Option<String>,
    },
    /// RSA key pair; signed JWT assertions are exchanged for access tokens.
    KeyPair {
        private_key_path: PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::AccessToken(_) => f.write_str("AccessToken(<redacted>)"),
            AuthMethod::RefreshToken { client_id, .. } => f
                .debug_struct("RefreshToken")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            AuthMethod::KeyPair {
                private_key_path, ..
            } => f
                .debug_struct("KeyPair")
                .field("private_key_path", private_key_path)
                .finish_non_exhaustive(),
        }
    }
}

/// Which 511NY feed the pipeline collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Cameras,
    Events,
    Speeds,
}

impl SourceKind {
    pub fn default_url(self) -> &'static str {
        match self {
            SourceKind::Cameras => DEFAULT_CAMERA_API_URL,
            SourceKind::Events => DEFAULT_EVENTS_API_URL,
            SourceKind::Speeds => DEFAULT_SPEEDS_API_URL,
        }
    }

    pub fn url_var(self) -> &'static str {
        match self {
            SourceKind::Cameras => "CAMERA_API_URL",
            SourceKind::Events => "EVENTS_API_URL",
            SourceKind::Speeds => "SPEEDS_API_URL",
        }
    }

    pub fn default_channel_prefix(self) -> &'static str {
        match self {
            SourceKind::Cameras => CAMERA_CHANNEL_PREFIX,
            SourceKind::Events => EVENTS_CHANNEL_PREFIX,
            SourceKind::Speeds => SPEEDS_CHANNEL_PREFIX,
        }
    }

    pub fn default_table(self) -> &'static str {
        match self {
            SourceKind::Cameras => "NYC_CAMERA_DATA",
            SourceKind::Events => "NYC_TRAFFIC_EVENTS",
            SourceKind::Speeds => "NYC_TRAFFIC_SPEEDS",
        }
    }

    /// What one record is, for notifications.
    pub fn noun(self) -> &'static str {
        match self {
            SourceKind::Cameras => "cameras",
            SourceKind::Events => "traffic events",
            SourceKind::Speeds => "road segments",
        }
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cameras" | "camera" => Ok(SourceKind::Cameras),
            "events" | "event" => Ok(SourceKind::Events),
            "speeds" | "speed" | "traffic" => Ok(SourceKind::Speeds),
            other => Err(anyhow!(
                "Unknown PIPELINE_SOURCE {other:?}, expected cameras, events or speeds"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackConfig {
    pub token: String,
    pub channel: String,
    pub api_url: String,
    pub status_every: u64,
    pub images_per_batch: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub database_url: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub account: String,
    pub user: String,
    pub auth: AuthMethod,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub role: String,
    pub account_url: String,
    pub channel_name_prefix: String,
    pub poll_interval: Duration,
    pub source_timeout: Duration,
    pub sink_timeout: Duration,
    pub request_timeout: Duration,
    pub token_refresh_margin: Duration,
    pub append_max_attempts: u32,
    pub append_backoff_base_ms: u64,
    pub proxy_url: Option<String>,
    pub source: SourceKind,
    pub source_url: String,
    pub ny511_api_key: Option<String>,
    pub slack: Option<SlackConfig>,
    pub postgres: Option<PostgresConfig>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        let file = match env::var("SNOWFLAKE_CONFIG_FILE") {
            Ok(path) if !path.is_empty() => {
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {path}"))?;
                serde_json::from_str::<FileConfig>(&contents)
                    .with_context(|| format!("Failed to parse config file {path}"))?
            }
            _ => FileConfig::default(),
        };

        let account = setting("SNOWFLAKE_ACCOUNT", file.account)
            .ok_or_else(|| anyhow!("SNOWFLAKE_ACCOUNT environment variable is not set"))?;
        let user = setting("SNOWFLAKE_USER", file.user)
            .ok_or_else(|| anyhow!("SNOWFLAKE_USER environment variable is not set"))?;

        let mut methods = Vec::new();
        if let Some(pat) = setting("SNOWFLAKE_PAT", file.pat) {
            methods.push(AuthMethod::AccessToken(pat));
        }
        if let Some(refresh_token) = setting("SNOWFLAKE_REFRESH_TOKEN", file.refresh_token) {
            methods.push(AuthMethod::RefreshToken {
                refresh_token,
                client_id: setting("SNOWFLAKE_OAUTH_CLIENT_ID", file.oauth_client_id),
                client_secret: setting("SNOWFLAKE_OAUTH_CLIENT_SECRET", file.oauth_client_secret),
            });
        }
        if let Some(path) = setting("SNOWFLAKE_PRIVATE_KEY_PATH", file.private_key_path) {
            methods.push(AuthMethod::KeyPair {
                private_key_path: PathBuf::from(path),
                passphrase: setting(
                    "SNOWFLAKE_PRIVATE_KEY_PASSPHRASE",
                    file.private_key_passphrase,
                ),
            });
        }
        if methods.len() > 1 {
            return Err(anyhow!(
                "More than one of SNOWFLAKE_PAT, SNOWFLAKE_REFRESH_TOKEN and SNOWFLAKE_PRIVATE_KEY_PATH is set, configure only one"
            ));
        }
        let auth = methods.pop().ok_or_else(|| {
            anyhow!(
                "No authentication method configured, set SNOWFLAKE_PAT, SNOWFLAKE_REFRESH_TOKEN or SNOWFLAKE_PRIVATE_KEY_PATH"
            )
        })?;

        let source = match env_string("PIPELINE_SOURCE") {
            Some(value) => value.parse::<SourceKind>()?,
            None => SourceKind::Cameras,
        };

        let poll_interval = env_secs("POLL_INTERVAL_SECONDS")?.unwrap_or(DEFAULT_BATCH_INTERVAL);
        if poll_interval.is_zero() {
            return Err(anyhow!("POLL_INTERVAL_SECONDS must be greater than zero"));
        }

        let account_url = setting("SNOWFLAKE_ACCOUNT_URL", file.account_url)
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| account_url(&account));

        let slack = env_string("SLACK_BOT_TOKEN").map(|token| SlackConfig {
            token,
            channel: env_string("SLACK_CHANNEL")
                .unwrap_or_else(|| DEFAULT_SLACK_CHANNEL.to_string()),
            api_url: env_string("SLACK_API_URL")
                .unwrap_or_else(|| DEFAULT_SLACK_API_URL.to_string()),
            status_every: env_parse("SLACK_STATUS_EVERY").unwrap_or(DEFAULT_SLACK_STATUS_EVERY),
            images_per_batch: env_parse("SLACK_IMAGES_PER_BATCH")
                .unwrap_or(DEFAULT_SLACK_IMAGES_PER_BATCH),
        });
        let postgres = env_string("DATABASE_URL").map(|database_url| PostgresConfig {
            database_url,
            table: env_string("POSTGRES_TABLE")
                .unwrap_or_else(|| DEFAULT_POSTGRES_TABLE.to_string()),
        });

        Ok(Config {
            account,
            user,
            auth,
            database: setting("SNOWFLAKE_DATABASE", file.database)
                .unwrap_or_else(|| "DEMO".to_string()),
            schema: setting("SNOWFLAKE_SCHEMA", file.schema).unwrap_or_else(|| "DEMO".to_string()),
            table: setting("SNOWFLAKE_TABLE", file.table)
                .unwrap_or_else(|| source.default_table().to_string()),
            role: setting("SNOWFLAKE_ROLE", file.role).unwrap_or_else(|| "PUBLIC".to_string()),
            account_url,
            channel_name_prefix: setting("STREAMING_CHANNEL_NAME", file.channel_name)
                .unwrap_or_else(|| source.default_channel_prefix().to_string()),
            poll_interval,
            source_timeout: env_secs("SOURCE_TIMEOUT_SECONDS")?.unwrap_or(DEFAULT_SOURCE_TIMEOUT),
            sink_timeout: env_secs("SINK_TIMEOUT_SECONDS")?.unwrap_or(DEFAULT_SINK_TIMEOUT),
            request_timeout: env_secs("REQUEST_TIMEOUT_SECONDS")?
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            token_refresh_margin: env_secs("TOKEN_REFRESH_MARGIN_SECONDS")?
                .unwrap_or(DEFAULT_TOKEN_REFRESH_MARGIN),
            append_max_attempts: env_parse::<u32>("APPEND_MAX_ATTEMPTS")
                .filter(|attempts| *attempts > 0)
                .unwrap_or(DEFAULT_APPEND_ATTEMPTS),
            append_backoff_base_ms: env_parse("APPEND_BACKOFF_BASE_MS")
                .unwrap_or(DEFAULT_APPEND_BACKOFF_BASE_MS),
            proxy_url: env_string("HTTPS_PROXY"),
            source,
            source_url: env_string(source.url_var())
                .unwrap_or_else(|| source.default_url().to_string()),
            ny511_api_key: env_string("NY511_API_KEY"),
            slack,
            postgres,
        })
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::ExponentialBackoff {
            attempts: self.append_max_attempts,
            base_ms: self.append_backoff_base_ms,
            max_ms: DEFAULT_APPEND_BACKOFF_MAX_MS,
        }
    }

    /// Scope requested for OAuth access tokens.
    pub fn oauth_scope(&self) -> String {
        format!(
            "session:role:{} database:{} schema:{}",
            self.role.to_uppercase(),
            self.database,
            self.schema
        )
    }

    /// Scope requested when exchanging a key-pair assertion.
    pub fn role_scope(&self) -> String {
        format!("session:role:{}", self.role.to_uppercase())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            interval: self.poll_interval,
            source_timeout: self.source_timeout,
            sink_timeout: self.sink_timeout,
        }
    }
}

/// Account host derived from the account identifier, honoring an optional region part
/// (`myorg-acct.us-east-1`).
pub fn account_url(account: &str) -> String {
    let account = account.trim().to_lowercase().replace('_', "-");
    let parts: Vec<&str> = account.split('.').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [name, region, ..] => format!("https://{name}.{region}.snowflakecomputing.com"),
        [name] => format!("https://{name}.snowflakecomputing.com"),
        [] => "https://snowflakecomputing.com".to_string(),
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

// The environment wins over the file.
fn setting(var: &str, file_value: Option<String>) -> Option<String> {
    env_string(var).or_else(|| file_value.filter(|value| !value.trim().is_empty()))
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    env_string(var).and_then(|value| value.trim().parse::<T>().ok())
}

// Fractional seconds. Unset means the default; anything unparseable is an error.
fn env_secs(var: &str) -> anyhow::Result<Option<Duration>> {
    let Some(value) = env_string(var) else {
        return Ok(None);
    };
    let secs = value
        .trim()
        .parse::<f64>()
        .with_context(|| format!("{var} must be a number of seconds, got {value:?}"))?;
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| anyhow!("{var} is out of range ({value}): {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplicate::duplicate_item;
    use serial_test::serial;
    use std::io::Write;

    const VARS: &[&str] = &[
        "SNOWFLAKE_CONFIG_FILE",
        "SNOWFLAKE_ACCOUNT",
        "SNOWFLAKE_USER",
        "SNOWFLAKE_PAT",
        "SNOWFLAKE_REFRESH_TOKEN",
        "SNOWFLAKE_OAUTH_CLIENT_ID",
        "SNOWFLAKE_OAUTH_CLIENT_SECRET",
        "SNOWFLAKE_DATABASE",
        "SNOWFLAKE_SCHEMA",
        "SNOWFLAKE_TABLE",
        "SNOWFLAKE_ROLE",
        "STREAMING_CHANNEL_NAME",
        "SNOWFLAKE_ACCOUNT_URL",
        "POLL_INTERVAL_SECONDS",
        "APPEND_MAX_ATTEMPTS",
        "SLACK_BOT_TOKEN",
        "SLACK_CHANNEL",
        "SLACK_STATUS_EVERY",
        "SLACK_IMAGES_PER_BATCH",
        "DATABASE_URL",
        "POSTGRES_TABLE",
        "SNOWFLAKE_PRIVATE_KEY_PATH",
        "SNOWFLAKE_PRIVATE_KEY_PASSPHRASE",
        "PIPELINE_SOURCE",
        "CAMERA_API_URL",
        "EVENTS_API_URL",
        "SPEEDS_API_URL",
        "NY511_API_KEY",
        "SOURCE_TIMEOUT_SECONDS",
        "SINK_TIMEOUT_SECONDS",
        "REQUEST_TIMEOUT_SECONDS",
        "TOKEN_REFRESH_MARGIN_SECONDS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    fn set_required() {
        env::set_var("SNOWFLAKE_ACCOUNT", "MYORG-ACCT");
        env::set_var("SNOWFLAKE_USER", "INGEST_USER");
        env::set_var("SNOWFLAKE_PAT", "pat-secret");
    }

    #[duplicate_item(
        test_name                       account                 expected;
        [test_account_url_plain]        ["MYORG-ACCT"]          ["https://myorg-acct.snowflakecomputing.com"];
        [test_account_url_underscore]   ["MYORG_ACCT"]          ["https://myorg-acct.snowflakecomputing.com"];
        [test_account_url_region]       ["xy12345.us-east-1"]   ["https://xy12345.us-east-1.snowflakecomputing.com"];
        [test_account_url_cloud]        ["xy12345.east-us-2.azure"] ["https://xy12345.east-us-2.snowflakecomputing.com"];
    )]
    #[test]
    fn test_name() {
        assert_eq!(account_url(account), expected);
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        set_required();
        let config = Config::from_env().unwrap();
        assert_eq!(config.auth, AuthMethod::AccessToken("pat-secret".to_string()));
        assert_eq!(config.database, "DEMO");
        assert_eq!(config.schema, "DEMO");
        assert_eq!(config.table, "NYC_CAMERA_DATA");
        assert_eq!(config.role, "PUBLIC");
        assert_eq!(config.account_url, "https://myorg-acct.snowflakecomputing.com");
        assert_eq!(config.channel_name_prefix, "NYC_CAM");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.sink_timeout, Duration::from_secs(5));
        assert_eq!(config.append_max_attempts, 3);
        assert_eq!(config.retry_strategy().max_attempts(), 3);
        assert!(config.slack.is_none());
        assert!(config.postgres.is_none());
        assert_eq!(config.source, SourceKind::Cameras);
        assert_eq!(config.source_url, "https://511ny.org/api/getcameras");
        assert!(config.ny511_api_key.is_none());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_error_if_no_account() {
        clear_env();
        env::set_var("SNOWFLAKE_USER", "INGEST_USER");
        env::set_var("SNOWFLAKE_PAT", "pat-secret");
        let config = Config::from_env();
        assert_eq!(
            config.unwrap_err().to_string(),
            "SNOWFLAKE_ACCOUNT environment variable is not set"
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_error_if_no_auth_method() {
        clear_env();
        env::set_var("SNOWFLAKE_ACCOUNT", "MYORG-ACCT");
        env::set_var("SNOWFLAKE_USER", "INGEST_USER");
        let config = Config::from_env();
        assert!(config
            .unwrap_err()
            .to_string()
            .starts_with("No authentication method configured"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_error_if_both_auth_methods() {
        clear_env();
        set_required();
        env::set_var("SNOWFLAKE_REFRESH_TOKEN", "refresh");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_refresh_token_auth_and_scope() {
        clear_env();
        env::set_var("SNOWFLAKE_ACCOUNT", "MYORG-ACCT");
        env::set_var("SNOWFLAKE_USER", "INGEST_USER");
        env::set_var("SNOWFLAKE_REFRESH_TOKEN", "refresh");
        env::set_var("SNOWFLAKE_OAUTH_CLIENT_ID", "client");
        env::set_var("SNOWFLAKE_ROLE", "ingest_role");
        env::set_var("SNOWFLAKE_DATABASE", "TRAFFIC");
        let config = Config::from_env().unwrap();
        assert_eq!(
            config.auth,
            AuthMethod::RefreshToken {
                refresh_token: "refresh".to_string(),
                client_id: Some("client".to_string()),
                client_secret: None,
            }
        );
        assert_eq!(
            config.oauth_scope(),
            "session:role:INGEST_ROLE database:TRAFFIC schema:DEMO"
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        set_required();
        env::set_var("SNOWFLAKE_ACCOUNT_URL", "http://127.0.0.1:3333/");
        env::set_var("POLL_INTERVAL_SECONDS", "2.5");
        env::set_var("APPEND_MAX_ATTEMPTS", "0");
        env::set_var("SLACK_BOT_TOKEN", "xoxb-test");
        env::set_var("SLACK_STATUS_EVERY", "10");
        env::set_var("DATABASE_URL", "postgres://localhost/cams");
        let config = Config::from_env().unwrap();
        assert_eq!(config.account_url, "http://127.0.0.1:3333");
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
        // Zero attempts would never send anything.
        assert_eq!(config.append_max_attempts, 3);
        let slack = config.slack.unwrap();
        assert_eq!(slack.channel, "#traffic-cameras");
        assert_eq!(slack.status_every, 10);
        assert_eq!(slack.images_per_batch, 3);
        assert_eq!(config.postgres.unwrap().table, "nyc_camera_data");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_file_config_is_layered_under_env() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"account":"FILE_ACCT","user":"FILE_USER","pat":"file-pat","database":"FILE_DB","channel_name":"FILE_CHAN"}}"#
        )
        .unwrap();
        env::set_var("SNOWFLAKE_CONFIG_FILE", file.path());
        env::set_var("SNOWFLAKE_DATABASE", "ENV_DB");

        let config = Config::from_env().unwrap();
        assert_eq!(config.account, "FILE_ACCT");
        assert_eq!(config.account_url, "https://file-acct.snowflakecomputing.com");
        assert_eq!(config.user, "FILE_USER");
        assert_eq!(config.auth, AuthMethod::AccessToken("file-pat".to_string()));
        assert_eq!(config.database, "ENV_DB");
        assert_eq!(config.channel_name_prefix, "FILE_CHAN");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unreadable_config_file() {
        clear_env();
        env::set_var("SNOWFLAKE_CONFIG_FILE", "/nonexistent/snowflake_config.json");
        assert!(Config::from_env()
            .unwrap_err()
            .to_string()
            .starts_with("Failed to read config file"));
        clear_env();
    }

    #[test]
    fn test_auth_method_debug_is_redacted() {
        let debug = format!("{:?}", AuthMethod::AccessToken("pat-secret".to_string()));
        assert!(!debug.contains("pat-secret"));
    }

    #[duplicate_item(
        test_name                           value;
        [test_poll_interval_overflow]       ["1e30"];
        [test_poll_interval_negative]       ["-1"];
        [test_poll_interval_not_a_number]   ["soon"];
        [test_poll_interval_nan]            ["NaN"];
        [test_poll_interval_zero]           ["0"];
    )]
    #[test]
    #[serial]
    fn test_name() {
        clear_env();
        set_required();
        env::set_var("POLL_INTERVAL_SECONDS", value);
        let error = Config::from_env().unwrap_err().to_string();
        assert!(error.contains("POLL_INTERVAL_SECONDS"), "{error}");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_timeout_out_of_range_is_an_error() {
        clear_env();
        set_required();
        env::set_var("SINK_TIMEOUT_SECONDS", "1e300");
        let error = Config::from_env().unwrap_err().to_string();
        assert!(error.starts_with("SINK_TIMEOUT_SECONDS is out of range"), "{error}");

        // Zero is a valid timeout, only the poll interval must be positive.
        env::set_var("SINK_TIMEOUT_SECONDS", "0");
        assert_eq!(Config::from_env().unwrap().sink_timeout, Duration::ZERO);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_key_pair_auth() {
        clear_env();
        env::set_var("SNOWFLAKE_ACCOUNT", "xy12345.us-east-1");
        env::set_var("SNOWFLAKE_USER", "INGEST_USER");
        env::set_var("SNOWFLAKE_PRIVATE_KEY_PATH", "/keys/rsa_key.p8");
        env::set_var("SNOWFLAKE_PRIVATE_KEY_PASSPHRASE", "hunter2");
        env::set_var("SNOWFLAKE_ROLE", "ingest_role");
        let config = Config::from_env().unwrap();
        assert_eq!(
            config.auth,
            AuthMethod::KeyPair {
                private_key_path: PathBuf::from("/keys/rsa_key.p8"),
                passphrase: Some("hunter2".to_string()),
            }
        );
        assert_eq!(config.role_scope(), "session:role:INGEST_ROLE");
        assert!(!format!("{:?}", config.auth).contains("hunter2"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_key_pair_from_file_conflicts_with_env_token() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"private_key_file":"/keys/rsa_key.p8"}}"#).unwrap();
        env::set_var("SNOWFLAKE_CONFIG_FILE", file.path());
        set_required();
        let error = Config::from_env().unwrap_err().to_string();
        assert!(error.starts_with("More than one of"), "{error}");

        env::remove_var("SNOWFLAKE_PAT");
        assert!(matches!(
            Config::from_env().unwrap().auth,
            AuthMethod::KeyPair { passphrase: None, .. }
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_source_kind_selects_feed_defaults() {
        clear_env();
        set_required();
        env::set_var("PIPELINE_SOURCE", "Speeds");
        env::set_var("NY511_API_KEY", "ny-key");
        let config = Config::from_env().unwrap();
        assert_eq!(config.source, SourceKind::Speeds);
        assert_eq!(config.source_url, "https://511ny.org/api/gettraffic");
        assert_eq!(config.channel_name_prefix, "NYC_TRAFFIC");
        assert_eq!(config.table, "NYC_TRAFFIC_SPEEDS");
        assert_eq!(config.ny511_api_key.as_deref(), Some("ny-key"));

        env::set_var("PIPELINE_SOURCE", "events");
        env::set_var("EVENTS_API_URL", "http://127.0.0.1:4444/events");
        env::set_var("CAMERA_API_URL", "http://127.0.0.1:4444/cameras");
        let config = Config::from_env().unwrap();
        assert_eq!(config.source, SourceKind::Events);
        assert_eq!(config.source_url, "http://127.0.0.1:4444/events");
        assert_eq!(config.channel_name_prefix, "NYC_EVENTS");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unknown_source_kind() {
        clear_env();
        set_required();
        env::set_var("PIPELINE_SOURCE", "weather");
        assert!(Config::from_env()
            .unwrap_err()
            .to_string()
            .starts_with("Unknown PIPELINE_SOURCE"));
        clear_env();
    }
}
