//! Gateway configuration
//!
//! Layered with figment: built-in defaults, then `agidentity.toml` (or the
//! file named by `AGID_CONFIG`), then `AGID_` environment variables with
//! `__` separating nested keys, e.g. `AGID_WEB__PORT=9000`.

use crate::conversation::ConversationSettings;
use crate::errors::{AgidError, AgidResult};
use crate::identity_gate::GateSettings;
use crate::pump::PumpSettings;
use crate::revocation::RevocationPolicy;
use crate::signer::Network;
use crate::transport::RetryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "AGID_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "agidentity.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub key_path: PathBuf,
    pub network: Network,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: default_data_dir().join("identity.json"),
            network: Network::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub require_certificate: bool,
    /// Hex public keys of certifiers whose certificates are accepted.
    pub trusted_certifiers: Vec<String>,
    pub max_iterations: usize,
    pub system_prompt: String,
    pub history_messages: usize,
    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            require_certificate: true,
            trusted_certifiers: Vec::new(),
            max_iterations: 10,
            system_prompt: "You are an autonomous agent with a verifiable cryptographic identity. \
                            Use the available tools when they help answer the request."
                .to_string(),
            history_messages: 40,
            rate_limit_requests: 30,
            rate_limit_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub cache_ttl_secs: u64,
    pub revocation_cache_ttl_secs: u64,
    pub revocation_failure_policy: RevocationPolicy,
    /// Spent revocation outpoints, one per line. Appended by `agidentity revoke`.
    pub revoked_outpoints_file: Option<PathBuf>,
    pub revocation_reload_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            revocation_cache_ttl_secs: 30,
            revocation_failure_policy: RevocationPolicy::FailClosed,
            revoked_outpoints_file: None,
            revocation_reload_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub preview_length: usize,
    pub max_previews: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            preview_length: 100,
            max_previews: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    pub call_timeout_secs: u64,
    /// Optional append-only commitment journal for the local signer.
    pub journal_path: Option<PathBuf>,
    /// `host:port` of a signer served by `agidentity serve-signer`. When set,
    /// the gateway signs through it instead of loading the key file.
    pub endpoint: Option<String>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            journal_path: None,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub call_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub inbox: String,
    pub reply_box: String,
    pub progress_box: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let pump = PumpSettings::default();
        Self {
            call_timeout_secs: 30,
            poll_interval_ms: pump.poll_interval.as_millis() as u64,
            inbox: pump.inbox,
            reply_box: pump.reply_box,
            progress_box: pump.progress_box,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub endpoint: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "default".to_string(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub audit_log_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            audit_log_path: data_dir.join("audit.jsonl"),
            data_dir,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub identity: IdentityConfig,
    pub gateway: GatewaySection,
    pub verification: VerificationConfig,
    pub conversations: ConversationConfig,
    pub signer: SignerConfig,
    pub transport: TransportConfig,
    pub model: ModelConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub workspace_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agidentity")
}

impl GatewayConfig {
    /// Defaults, then the config file, then the environment.
    pub fn load() -> AgidResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> AgidResult<Self> {
        let config: GatewayConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("AGID_").split("__"))
    }

    pub fn validate(&self) -> AgidResult<()> {
        for key in &self.gateway.trusted_certifiers {
            let valid = hex::decode(key).map(|bytes| bytes.len() == 32).unwrap_or(false);
            if !valid {
                return Err(AgidError::config(format!(
                    "trusted certifier '{key}' is not a 32-byte hex public key"
                )));
            }
        }
        if self.gateway.max_iterations == 0 {
            return Err(AgidError::config("gateway.max_iterations must be at least 1"));
        }
        if self.gateway.rate_limit_requests == 0 || self.gateway.rate_limit_window_secs == 0 {
            return Err(AgidError::config("gateway rate limit must be non-zero"));
        }
        let timeouts = [
            ("signer.call_timeout_secs", self.signer.call_timeout_secs),
            ("transport.call_timeout_secs", self.transport.call_timeout_secs),
            ("model.timeout_secs", self.model.timeout_secs),
            ("verification.cache_ttl_secs", self.verification.cache_ttl_secs),
            ("verification.revocation_reload_secs", self.verification.revocation_reload_secs),
            ("conversations.idle_timeout_secs", self.conversations.idle_timeout_secs),
            ("conversations.sweep_interval_secs", self.conversations.sweep_interval_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(AgidError::config(format!("{name} must be non-zero")));
            }
        }
        if matches!(&self.signer.endpoint, Some(endpoint) if endpoint.trim().is_empty()) {
            return Err(AgidError::config("signer.endpoint must not be empty when set"));
        }
        if self.transport.max_attempts == 0 {
            return Err(AgidError::config("transport.max_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn signer_timeout(&self) -> Duration {
        Duration::from_secs(self.signer.call_timeout_secs)
    }

    pub fn revocation_reload_interval(&self) -> Duration {
        Duration::from_secs(self.verification.revocation_reload_secs)
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            require_certificate: self.gateway.require_certificate,
            cache_ttl: Duration::from_secs(self.verification.cache_ttl_secs),
            revocation_cache_ttl: Duration::from_secs(self.verification.revocation_cache_ttl_secs),
            revocation_policy: self.verification.revocation_failure_policy,
        }
    }

    pub fn conversation_settings(&self) -> ConversationSettings {
        ConversationSettings {
            idle_timeout: Duration::from_secs(self.conversations.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.conversations.sweep_interval_secs),
            preview_len: self.conversations.preview_length,
            max_previews: self.conversations.max_previews,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.transport.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.transport.max_backoff_ms),
            max_attempts: self.transport.max_attempts,
        }
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            inbox: self.transport.inbox.clone(),
            reply_box: self.transport.reply_box.clone(),
            progress_box: self.transport.progress_box.clone(),
            poll_interval: Duration::from_millis(self.transport.poll_interval_ms),
            call_timeout: Duration::from_secs(self.transport.call_timeout_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn anchor_db_path(&self) -> PathBuf {
        self.storage.data_dir.join("anchors.sled")
    }

    /// Effective configuration as TOML, for `agidentity config`.
    pub fn to_toml(&self) -> AgidResult<String> {
        toml::to_string_pretty(self).map_err(|e| AgidError::config(format!("render config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.conversations.idle_timeout_secs, 1800);
        assert_eq!(config.conversations.sweep_interval_secs, 300);
        assert_eq!(config.signer.call_timeout_secs, 30);
        assert_eq!(config.verification.cache_ttl_secs, 300);
        assert_eq!(config.verification.revocation_cache_ttl_secs, 30);
        assert_eq!(config.verification.revocation_failure_policy, RevocationPolicy::FailClosed);
        assert_eq!(config.gateway.max_iterations, 10);
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agidentity.toml");
        std::fs::write(
            &path,
            r#"
workspace_dir = "/tmp/agent-workspace"

[gateway]
max_iterations = 4
trusted_certifiers = ["0000000000000000000000000000000000000000000000000000000000000001"]

[web]
port = 9090
"#,
        )
        .unwrap();

        let config: GatewayConfig = GatewayConfig::figment(&path).extract().unwrap();
        config.validate().unwrap();
        assert_eq!(config.gateway.max_iterations, 4);
        assert_eq!(config.web.port, 9090);
        assert_eq!(config.workspace_dir, Some(PathBuf::from("/tmp/agent-workspace")));
        // untouched sections keep defaults
        assert!(config.gateway.require_certificate);
        assert_eq!(config.web.host, "127.0.0.1");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.gateway.trusted_certifiers = vec!["not-hex".to_string()];
        assert!(matches!(config.validate(), Err(AgidError::Config { .. })));

        let mut config = GatewayConfig::default();
        config.gateway.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.signer.call_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.signer.endpoint = Some("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_renders_as_toml() {
        let rendered = GatewayConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[gateway]"));
        assert!(rendered.contains("max_iterations = 10"));
    }
}
