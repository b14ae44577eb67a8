//! Process settings, loaded from `EVMPROXY_*` environment variables.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const ENV_PREFIX: &str = "EVMPROXY_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Deployment environment name (`dev`, `staging`, `prod`, ...).
    pub env: String,
    pub api_bind: String,
    pub api_port: u16,
    /// Chains config YAML path; the embedded default is used when unset.
    pub config_path: Option<PathBuf>,
    /// Secrets YAML path (flat `name: value` map).
    pub secrets_path: Option<PathBuf>,
    /// Substitute public endpoints for chains whose private nodes all miss
    /// a real secret.
    pub fallback_to_public: bool,
    /// `token -> requester name`.
    pub auth_tokens: BTreeMap<String, String>,
    pub do_upstream_debug: bool,
    /// Stats sink URL; stats are skipped entirely when unset.
    pub stats_url: Option<String>,
    pub stats_table: String,
    /// Environment label used in stats rows, defaulting to `env`.
    pub stats_env_name: Option<String>,
    pub stats_sync_period_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            api_bind: "0.0.0.0".to_string(),
            api_port: 13_431,
            config_path: None,
            secrets_path: None,
            fallback_to_public: true,
            auth_tokens: BTreeMap::from([(
                "xlocalonlyauthtoken".to_string(),
                "xlocalonly".to_string(),
            )]),
            do_upstream_debug: false,
            stats_url: None,
            stats_table: "evmrpc_request_stats".to_string(),
            stats_env_name: None,
            stats_sync_period_secs: 60,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|value| !value.is_empty())
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    env_var(name)
        .map(|value| match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(Error::config(format!(
                "{ENV_PREFIX}{name} is not a boolean: {other:?}"
            ))),
        })
        .transpose()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    env_var(name)
        .map(|value| {
            value.parse::<T>().map_err(|_| {
                Error::config(format!("{ENV_PREFIX}{name} failed to parse: {value:?}"))
            })
        })
        .transpose()
}

impl Settings {
    /// Reads the settings from the process environment on top of the
    /// defaults. `EVMPROXY_AUTH_TOKENS` is a YAML/JSON map
    /// `token -> requester name`.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        if let Some(env) = env_var("ENV") {
            settings.env = env;
        }
        if let Some(bind) = env_var("API_BIND") {
            settings.api_bind = bind;
        }
        if let Some(port) = env_parse("API_PORT")? {
            settings.api_port = port;
        }
        settings.config_path = env_var("CONFIG_PATH").map(PathBuf::from);
        settings.secrets_path = env_var("SECRETS_PATH").map(PathBuf::from);
        if let Some(fallback) = env_bool("FALLBACK_TO_PUBLIC")? {
            settings.fallback_to_public = fallback;
        }
        if let Some(tokens_raw) = env_var("AUTH_TOKENS") {
            settings.auth_tokens = serde_yaml::from_str(&tokens_raw).map_err(|err| {
                Error::config(format!("{ENV_PREFIX}AUTH_TOKENS failed to parse: {err}"))
            })?;
        }
        if let Some(debug) = env_bool("DO_UPSTREAM_DEBUG")? {
            settings.do_upstream_debug = debug;
        }
        settings.stats_url = env_var("STATS_URL");
        if let Some(table) = env_var("STATS_TABLE") {
            settings.stats_table = table;
        }
        settings.stats_env_name = env_var("STATS_ENV_NAME");
        if let Some(period) = env_parse("STATS_SYNC_PERIOD_SECS")? {
            settings.stats_sync_period_secs = period;
        }
        Ok(settings)
    }

    /// The environment label for stats rows.
    #[must_use]
    pub fn stats_env(&self) -> &str {
        self.stats_env_name.as_deref().unwrap_or(&self.env)
    }

    /// Resolves a caller token to its requester name.
    #[must_use]
    pub fn requester_for_token(&self, token: &str) -> Option<&str> {
        self.auth_tokens.get(token).map(String::as_str)
    }
}
