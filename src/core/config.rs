//! Configuration for both halves of the crate: the widget session (labels,
//! quick actions, endpoint) and the relay (bind address, provider, model).
//! Stored as TOML under the platform config directory; every field has a
//! working default so a missing file runs out of the box. Provider
//! credentials never live here; the relay reads them from the environment.

use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// One tappable shortcut rendered by the widget. Submitting it sends the
/// label as the user message; the description is display-only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QuickAction {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WidgetConfig {
    /// Header label of the widget panel.
    pub title: String,
    /// Greeting line shown before the first message.
    pub greeting: String,
    /// Input placeholder text.
    pub placeholder: String,
    /// Full URL of the relay's widget route.
    pub endpoint: String,
    pub quick_actions: Vec<QuickAction>,
    pub suggested_questions: Vec<String>,
    /// Nudges offered once the first exchange has completed.
    pub followup_questions: Vec<String>,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            title: "Chat with us".to_string(),
            greeting: "Hi! I can answer questions about our services, process, and pricing."
                .to_string(),
            placeholder: "Type your question...".to_string(),
            endpoint: "http://127.0.0.1:3939/api/chat/widget".to_string(),
            quick_actions: vec![
                QuickAction {
                    label: "What services do you offer?".to_string(),
                    description: Some("Websites, web apps, and ongoing support".to_string()),
                },
                QuickAction {
                    label: "How does pricing work?".to_string(),
                    description: Some("Fixed quotes and typical ranges".to_string()),
                },
                QuickAction {
                    label: "How do projects run?".to_string(),
                    description: Some("Process from first call to launch".to_string()),
                },
            ],
            suggested_questions: vec![
                "How long does a typical project take?".to_string(),
                "Can you work with our existing site?".to_string(),
                "How do we get started?".to_string(),
            ],
            followup_questions: vec![
                "What would something like this cost?".to_string(),
                "Can I see examples of your work?".to_string(),
                "What do you need from us to start?".to_string(),
            ],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address for the relay server.
    pub bind: String,
    /// Path of the widget route.
    pub route: String,
    /// OpenAI-compatible provider base URL.
    pub base_url: String,
    pub model: String,
    /// Prepended to every turn as the system message when set.
    pub system_prompt: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3939".to_string(),
            route: "/api/chat/widget".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
        }
    }
}

impl RelayConfig {
    /// Bearer key for the provider, from `OPENAI_API_KEY`. Empty is allowed
    /// for keyless local providers.
    pub fn api_key_from_env() -> String {
        std::env::var("OPENAI_API_KEY").unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub widget: WidgetConfig,
    pub relay: RelayConfig,
}

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The file parsed but holds a value the crate cannot run with.
    Invalid { path: PathBuf, detail: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(
                    f,
                    "Failed to read config at {}: {}",
                    path_display(path),
                    source
                )
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    path_display(path),
                    source
                )
            }
            ConfigError::Invalid { path, detail } => {
                write!(f, "Invalid config at {}: {}", path_display(path), detail)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl Config {
    /// Loads from the given path, or the platform default when `None`.
    /// A missing file yields the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path(),
        };
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;
        config.validate(config_path)?;
        Ok(config)
    }

    /// Route paths without a leading slash would panic at router
    /// construction; reject them here with a pointer to the file instead.
    fn validate(&self, config_path: &Path) -> Result<(), ConfigError> {
        if !self.relay.route.starts_with('/') {
            return Err(ConfigError::Invalid {
                path: config_path.to_path_buf(),
                detail: format!(
                    "relay.route must start with '/', got {:?}",
                    self.relay.route
                ),
            });
        }
        Ok(())
    }

    /// Writes the file atomically: content goes to a temp file in the target
    /// directory and is persisted over the target only once fully flushed.
    pub fn save_to_path(&self, config_path: &Path) -> Result<(), Box<dyn StdError>> {
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(config_path)
            .map_err(|err| -> Box<dyn StdError> { Box::new(err) })?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        let proj_dirs = ProjectDirs::from("org", "permacommons", "parloir")
            .expect("Failed to determine config directory");
        proj_dirs.config_dir().join("config.toml")
    }
}

/// User-friendly display string for a path, with `~` notation on Unix when
/// the path sits under the home directory.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
