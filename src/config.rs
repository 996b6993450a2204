use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{Plan, PolicyConfig};
use crate::purchase::PurchaseConfig;
use crate::verifier::PaymentVerifier;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("missing secret: environment variable {0} is not set")]
    MissingSecret(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// `.toml` selects TOML; everything else is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub purchase: PurchaseConfig,
    /// Environment variable holding the admin bearer token. Admin routes are disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token_env: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub token: String,
    #[serde(default = "default_plan")]
    pub plan: Plan,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("plan", &self.plan)
            .finish()
    }
}

impl UserConfig {
    pub fn new(id: impl Into<String>, token: impl Into<String>, plan: Plan) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            plan,
        }
    }
}

fn default_plan() -> Plan {
    Plan::Free
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfig {
    #[serde(default = "default_key_secret_env")]
    pub key_secret_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret_env: Option<String>,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            key_secret_env: default_key_secret_env(),
            webhook_secret_env: None,
        }
    }
}

fn default_key_secret_env() -> String {
    "PAYMENT_KEY_SECRET".to_string()
}

impl LedgerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, ConfigFormat::from_path(path))
    }

    pub fn parse(raw: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Self = match format {
            ConfigFormat::Json => serde_json::from_str(raw)?,
            ConfigFormat::Toml => toml::from_str(raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = BTreeSet::new();
        let mut tokens = BTreeSet::new();
        for user in &self.users {
            if user.id.trim().is_empty() {
                return Err(ConfigError::Invalid("user id must not be empty".to_string()));
            }
            if user.token.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "user {} has an empty token",
                    user.id
                )));
            }
            if !ids.insert(user.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate user id: {}", user.id)));
            }
            if !tokens.insert(user.token.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "user {} reuses another user's token",
                    user.id
                )));
            }
        }
        if self.payment.key_secret_env.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "payment.key_secret_env must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn verifier_from_env(&self) -> Result<PaymentVerifier, ConfigError> {
        self.resolve_verifier(|key| std::env::var(key).ok())
    }

    pub fn resolve_verifier<F>(&self, lookup: F) -> Result<PaymentVerifier, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key_secret = require_secret(&lookup, &self.payment.key_secret_env)?;
        let mut verifier = PaymentVerifier::new(key_secret);
        if let Some(env) = self.payment.webhook_secret_env.as_deref() {
            verifier = verifier.with_webhook_secret(require_secret(&lookup, env)?);
        }
        Ok(verifier)
    }

    pub fn admin_token_from_env(&self) -> Result<Option<String>, ConfigError> {
        self.resolve_admin_token(|key| std::env::var(key).ok())
    }

    pub fn resolve_admin_token<F>(&self, lookup: F) -> Result<Option<String>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.admin_token_env
            .as_deref()
            .map(|env| require_secret(&lookup, env))
            .transpose()
    }
}

fn require_secret<F>(lookup: &F, env: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(env)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingSecret(env.to_string()))
}
