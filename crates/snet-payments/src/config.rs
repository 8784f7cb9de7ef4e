//! SDK configuration: a TOML file plus environment overrides.
//!
//! Lookup order is an explicit path, then `$SNET_CONFIG`, then
//! `~/.snet/config.toml`. A missing home config falls back to defaults; a
//! missing explicit or `$SNET_CONFIG` file is an error. The private key is
//! only ever taken from the environment.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::metadata::StaticRegistry;
use crate::options::JobOptions;
use crate::state::DEFAULT_STATE_TIMEOUT_MS;
use crate::units::Address;

pub const ENV_CONFIG_PATH: &str = "SNET_CONFIG";
pub const ENV_LEDGER_GATEWAY_URL: &str = "SNET_LEDGER_GATEWAY_URL";
pub const ENV_LEDGER_AUTH_TOKEN: &str = "SNET_LEDGER_AUTH_TOKEN";
pub const ENV_PRIVATE_KEY: &str = "SNET_PRIVATE_KEY";
pub const DEFAULT_IPFS_GATEWAY_URL: &str = "https://ipfs.singularitynet.io";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("missing configuration value `{0}`")]
    Missing(&'static str),
    #[error("service `{0}` is not configured")]
    UnknownService(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub metadata_uri: String,
    #[serde(default)]
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub ledger_gateway_url: Option<String>,
    pub ledger_auth_token: Option<String>,
    pub ipfs_gateway_url: String,
    pub mpe_contract_address: Option<Address>,
    pub state_timeout_ms: u64,
    /// Keyed by `org_id/service_id`.
    pub services: BTreeMap<String, ServiceEntry>,
    pub job: JobOptions,
    #[serde(skip)]
    pub private_key: Option<String>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            ledger_gateway_url: None,
            ledger_auth_token: None,
            ipfs_gateway_url: DEFAULT_IPFS_GATEWAY_URL.to_string(),
            mpe_contract_address: None,
            state_timeout_ms: DEFAULT_STATE_TIMEOUT_MS,
            services: BTreeMap::new(),
            job: JobOptions::default(),
            private_key: None,
        }
    }
}

impl SdkConfig {
    /// Loads configuration from disk and the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let lookup = |name: &str| std::env::var(name).ok();
        let (mut config, path) = Self::load_with(explicit, lookup, dirs::home_dir())?;
        config.apply_env(lookup);
        Ok((config, path))
    }

    fn load_with(
        explicit: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
        home: Option<PathBuf>,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let required = explicit.map(Path::to_path_buf).or_else(|| {
            lookup(ENV_CONFIG_PATH)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        });
        if let Some(path) = required {
            let config = Self::from_file(&path)?;
            return Ok((config, Some(path)));
        }

        if let Some(path) = home.map(|home| home.join(".snet").join("config.toml"))
            && path.is_file()
        {
            let config = Self::from_file(&path)?;
            return Ok((config, Some(path)));
        }
        Ok((Self::default(), None))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|error| error.to_string())
    }

    /// Applies `SNET_*` overrides. Blank values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(url) = read(ENV_LEDGER_GATEWAY_URL) {
            self.ledger_gateway_url = Some(url);
        }
        if let Some(token) = read(ENV_LEDGER_AUTH_TOKEN) {
            self.ledger_auth_token = Some(token);
        }
        if let Some(key) = read(ENV_PRIVATE_KEY) {
            self.private_key = Some(key);
        }
    }

    pub fn service(&self, org_id: &str, service_id: &str) -> Result<&ServiceEntry, ConfigError> {
        let key = format!("{org_id}/{service_id}");
        self.services
            .get(&key)
            .ok_or(ConfigError::UnknownService(key))
    }

    #[must_use]
    pub fn registry(&self) -> StaticRegistry {
        StaticRegistry::from_entries(
            self.services
                .iter()
                .map(|(key, entry)| (key.clone(), entry.metadata_uri.clone()))
                .collect::<HashMap<_, _>>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::{ConfigError, ENV_CONFIG_PATH, SdkConfig};
    use crate::metadata::Registry;
    use crate::units::Cogs;

    const SAMPLE: &str = r#"
ledger_gateway_url = "http://ledger.local:8545"
ipfs_gateway_url = "http://ipfs.local:5001"
mpe_contract_address = "0x5e592f9b1d303183d963635f895f0f0c48284f4e"
state_timeout_ms = 2500

[services."snet/example-service"]
metadata_uri = "ipfs://QmExample"
group_name = "default_group"

[job]
autohandle_escrow = true
channel_topup_amount = "1000"
channel_topup_expiration = 20000000
"#;

    fn env(entries: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn toml_fields_and_job_defaults_parse() -> Result<(), String> {
        let config = SdkConfig::from_toml_str(SAMPLE)?;
        assert_eq!(
            config.ledger_gateway_url.as_deref(),
            Some("http://ledger.local:8545")
        );
        assert_eq!(config.state_timeout_ms, 2500);
        assert!(config.job.autohandle_channel);
        assert!(config.job.autohandle_escrow);
        assert_eq!(config.job.channel_topup_amount, Some(Cogs::new(1000)));
        assert_eq!(config.job.channel_topup_expiration, Some(20_000_000));
        assert_eq!(config.private_key, None);

        let entry = config
            .service("snet", "example-service")
            .map_err(|error| error.to_string())?;
        assert_eq!(entry.group_name.as_deref(), Some("default_group"));
        assert!(matches!(
            config.service("snet", "missing"),
            Err(ConfigError::UnknownService(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn registry_is_built_from_service_table() -> Result<(), Box<dyn std::error::Error>> {
        let config = SdkConfig::from_toml_str(SAMPLE)?;
        let uri = config
            .registry()
            .service_metadata_uri("snet", "example-service")
            .await?;
        assert_eq!(uri, "ipfs://QmExample");
        Ok(())
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() -> Result<(), String> {
        let mut config = SdkConfig::from_toml_str(SAMPLE)?;
        config.apply_env(env(&[
            ("SNET_LEDGER_GATEWAY_URL", "http://override:1"),
            ("SNET_LEDGER_AUTH_TOKEN", "  "),
            ("SNET_PRIVATE_KEY", "0xabc"),
        ]));
        assert_eq!(config.ledger_gateway_url.as_deref(), Some("http://override:1"));
        assert_eq!(config.ledger_auth_token, None);
        assert_eq!(config.private_key.as_deref(), Some("0xabc"));
        Ok(())
    }

    #[test]
    fn lookup_order_prefers_explicit_then_env_then_home() -> Result<(), Box<dyn std::error::Error>>
    {
        let home = tempfile::tempdir()?;
        std::fs::create_dir_all(home.path().join(".snet"))?;
        std::fs::write(
            home.path().join(".snet/config.toml"),
            "state_timeout_ms = 111\n",
        )?;
        let env_file = home.path().join("env.toml");
        std::fs::write(&env_file, "state_timeout_ms = 222\n")?;
        let explicit = home.path().join("explicit.toml");
        std::fs::write(&explicit, "state_timeout_ms = 333\n")?;
        let env_path = env_file.display().to_string();

        let (config, path) = SdkConfig::load_with(
            Some(&explicit),
            env(&[(ENV_CONFIG_PATH, env_path.as_str())]),
            Some(home.path().to_path_buf()),
        )?;
        assert_eq!((config.state_timeout_ms, path), (333, Some(explicit.clone())));

        let (config, _) = SdkConfig::load_with(
            None,
            env(&[(ENV_CONFIG_PATH, env_path.as_str())]),
            Some(home.path().to_path_buf()),
        )?;
        assert_eq!(config.state_timeout_ms, 222);

        let (config, _) =
            SdkConfig::load_with(None, env(&[]), Some(home.path().to_path_buf()))?;
        assert_eq!(config.state_timeout_ms, 111);

        let (config, path) =
            SdkConfig::load_with(None, env(&[]), Some(PathBuf::from("/nonexistent")))?;
        assert_eq!((config, path), (SdkConfig::default(), None));

        assert!(matches!(
            SdkConfig::load_with(Some(&home.path().join("absent.toml")), env(&[]), None),
            Err(ConfigError::Read { .. })
        ));
        Ok(())
    }
}
