use std::path::PathBuf;
use std::sync::Arc;

use agentcanvas_llm::{ApiType, ProviderConfig};
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u64 = 2000;
pub const SETTINGS_DIRECTORY_NAME: &str = "agentcanvas";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
/// Environment prefix; `AGENTCANVAS_API_KEY` etc. override the settings file.
pub const ENV_PREFIX: &str = "AGENTCANVAS_";

/// How to call the remote model. Read-only during an in-flight request:
/// every turn works on a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub api_type: ApiType,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub azure_deployment: String,
    #[serde(default)]
    pub azure_api_version: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_type: ApiType::OpenAi,
            model: default_model(),
            endpoint: default_endpoint(),
            api_key: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            azure_deployment: String::new(),
            azure_api_version: String::new(),
        }
    }
}

impl ProviderSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Provider-accepted ranges; must pass before a provider is built.
    pub fn validate(&self) -> Result<(), SettingsError> {
        ensure!(
            self.temperature.is_finite() && (0.0..=2.0).contains(&self.temperature),
            InvalidTemperatureSnafu {
                value: self.temperature,
            }
        );
        ensure!(
            self.max_tokens > 0,
            InvalidMaxTokensSnafu {
                value: self.max_tokens,
            }
        );
        Ok(())
    }

    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if !self.is_configured() {
            return None;
        }

        let config = ProviderConfig::new(
            "",
            &self.api_key,
            &self.endpoint,
            Some(self.model.clone()),
        );

        Some(match self.api_type {
            ApiType::OpenAi => config,
            ApiType::Azure => {
                config.with_azure(&self.azure_deployment, &self.azure_api_version)
            }
        })
    }

    pub fn normalized(mut self) -> Self {
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.azure_deployment = self.azure_deployment.trim().to_string();
        self.azure_api_version = self.azure_api_version.trim().to_string();
        self
    }
}

/// Settings persistence with environment lock-down.
///
/// When the API key arrived through the environment the store refuses edits:
/// the hosting environment owns the credentials, not the settings form.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ProviderSettings>>,
    config_path: PathBuf,
    locked: bool,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".agentcanvas"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let locked = std::env::var(format!("{ENV_PREFIX}API_KEY"))
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        Self::assemble(config_path, locked)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    fn assemble(config_path: PathBuf, locked: bool) -> Self {
        let settings = Self::load_merged(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
            locked,
        }
    }

    pub fn snapshot(&self) -> Arc<ProviderSettings> {
        self.settings.load_full()
    }

    /// True when settings edits are rejected (API key injected by environment).
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn update(&self, settings: ProviderSettings) -> Result<(), SettingsError> {
        ensure!(!self.locked, SettingsLockedSnafu);

        let normalized = settings.normalized();
        normalized.validate()?;
        self.persist(&normalized)?;
        self.settings.store(Arc::new(normalized));
        Ok(())
    }

    fn load_merged(path: &PathBuf) -> ProviderSettings {
        let figment = Figment::from(Serialized::defaults(ProviderSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ProviderSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to assemble settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ProviderSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ProviderSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("temperature {value} is outside the accepted range [0, 2]"))]
    InvalidTemperature { value: f64 },
    #[snafu(display("max_tokens must be positive, got {value}"))]
    InvalidMaxTokens { value: u64 },
    #[snafu(display("settings are locked because the API key is environment-provided"))]
    SettingsLocked,
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}
