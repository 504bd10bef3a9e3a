use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const APP_NAME: &str = "upkeep";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const VERSION_FILE_NAME: &str = "VERSION";
pub const FEEDBACK_FILE_NAME: &str = "feedback.json";
pub const FEEDBACK_CSV_NAME: &str = "feedback.csv";
pub const CLEAN_START_MARKER: &str = "last_clean_start";

/// Where the self-update looks for releases and which asset it installs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateSettings {
    pub repo_owner: String,
    pub repo_name: String,
    /// Release asset name expected for this platform. Defaults to the
    /// package name, with `.exe` appended on Windows.
    #[serde(default = "default_executable_name")]
    pub executable_name: String,
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_executable_name() -> String {
    if cfg!(windows) {
        format!("{}.exe", APP_NAME)
    } else {
        APP_NAME.to_string()
    }
}
fn default_check_timeout() -> u64 {
    10
}
fn default_download_timeout() -> u64 {
    30
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            repo_owner: String::new(),
            repo_name: String::new(),
            executable_name: default_executable_name(),
            check_timeout_secs: default_check_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

impl UpdateSettings {
    pub fn full_repo(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

/// Named form-entry identifiers for the remote feedback endpoint.
///
/// The collection endpoint is a public form whose fields are opaque
/// `entry.N` ids; they are configuration, not code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormFields {
    pub kind: String,
    pub description: String,
    pub metadata: String,
    pub timestamp: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackSettings {
    /// POST target for feedback delivery. When unset, records are kept
    /// locally and stay undelivered.
    #[serde(default)]
    pub form_url: Option<String>,
    #[serde(default)]
    pub fields: FormFields,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_send_timeout() -> u64 {
    10
}
fn default_max_records() -> usize {
    100
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            form_url: None,
            fields: FormFields::default(),
            send_timeout_secs: default_send_timeout(),
            max_records: default_max_records(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub update: UpdateSettings,
    #[serde(default)]
    pub feedback: FeedbackSettings,
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("UPKEEP_CONFIG_DIR") {
        let path = PathBuf::from(dir);
        fs::create_dir_all(&path)?;
        return Ok(path);
    }
    let path = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_NAME);
    fs::create_dir_all(&path)?;
    Ok(path)
}

pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("UPKEEP_DATA_DIR") {
        let path = PathBuf::from(dir);
        fs::create_dir_all(&path)?;
        return Ok(path);
    }
    let path = dirs::data_dir()
        .ok_or_else(|| anyhow!("Could not determine data directory"))?
        .join(APP_NAME);
    tracing::debug!("User data directory: {}", path.display());
    fs::create_dir_all(&path)?;
    Ok(path)
}

pub fn get_config_file_path() -> Result<PathBuf> {
    let path = get_config_dir()?.join(CONFIG_FILE_NAME);
    tracing::debug!("Config file path: {}", path.display());
    Ok(path)
}

pub fn load_config() -> Result<AppConfig> {
    let config_path = get_config_file_path()?;

    let mut config = if config_path.exists() {
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Could not read config file at {}", config_path.display()))?;
        serde_json::from_str(&content).with_context(|| "Could not parse config file as JSON")?
    } else {
        // First run: materialize the defaults so users have a file to edit
        let config = AppConfig::default();
        if let Err(e) = save_config(&config) {
            tracing::warn!("Could not write default config: {}", e);
        }
        config
    };

    // Environment overrides take precedence over the file
    if let Ok(repo) = std::env::var("UPKEEP_REPO") {
        match repo.split_once('/') {
            Some((owner, name)) => {
                config.update.repo_owner = owner.to_string();
                config.update.repo_name = name.to_string();
            }
            None => tracing::warn!("Ignoring UPKEEP_REPO '{}': expected owner/name", repo),
        }
    }
    if let Ok(name) = std::env::var("UPKEEP_EXECUTABLE_NAME") {
        config.update.executable_name = name;
    }
    if let Ok(url) = std::env::var("UPKEEP_FORM_URL") {
        if url.is_empty() {
            config.feedback.form_url = None;
        } else {
            config.feedback.form_url = Some(url);
        }
    }

    validate(&config)?;
    Ok(config)
}

pub fn save_config(config: &AppConfig) -> Result<()> {
    let config_path = get_config_file_path()?;
    let content = serde_json::to_string_pretty(config)?;
    fs::write(&config_path, content)?;
    Ok(())
}

/// Reject configurations that would fail at call time. Checked once at
/// load rather than on every string-keyed access.
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.update.executable_name.is_empty() {
        return Err(anyhow!("update.executable_name must not be empty"));
    }
    if config.update.repo_owner.contains('/') || config.update.repo_name.contains('/') {
        return Err(anyhow!(
            "update.repo_owner/repo_name must be plain names, not paths"
        ));
    }
    if let Some(url) = &config.feedback.form_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(anyhow!("feedback.form_url must be an http(s) URL"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        validate(&config).unwrap();
        assert_eq!(config.update.check_timeout_secs, 10);
        assert_eq!(config.update.download_timeout_secs, 30);
        assert_eq!(config.feedback.max_records, 100);
        assert!(config.feedback.form_url.is_none());
    }

    #[test]
    fn rejects_non_http_form_url() {
        let mut config = AppConfig::default();
        config.feedback.form_url = Some("ftp://example.com/form".to_string());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_repo_with_slash() {
        let mut config = AppConfig::default();
        config.update.repo_owner = "owner/extra".to_string();
        assert!(validate(&config).is_err());
    }

    // Single test for all env overrides: nothing else in this test binary
    // touches these variables, so there is no cross-test interference.
    #[test]
    fn env_overrides_apply_after_load() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("UPKEEP_CONFIG_DIR", dir.path());
        std::env::set_var("UPKEEP_REPO", "acme/scanner");
        std::env::set_var("UPKEEP_FORM_URL", "https://forms.example.com/r/abc");

        let config = load_config().unwrap();
        assert_eq!(config.update.repo_owner, "acme");
        assert_eq!(config.update.repo_name, "scanner");
        assert_eq!(
            config.feedback.form_url.as_deref(),
            Some("https://forms.example.com/r/abc")
        );

        // Empty URL clears a file-configured endpoint
        std::env::set_var("UPKEEP_FORM_URL", "");
        let config = load_config().unwrap();
        assert!(config.feedback.form_url.is_none());

        // A value without an owner/name separator is ignored
        std::env::set_var("UPKEEP_REPO", "just-a-name");
        let config = load_config().unwrap();
        assert!(config.update.repo_owner.is_empty());
        assert!(config.update.repo_name.is_empty());

        for var in ["UPKEEP_CONFIG_DIR", "UPKEEP_REPO", "UPKEEP_FORM_URL"] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"update": {"repo_owner": "acme", "repo_name": "scanner"}}"#,
        )
        .unwrap();
        assert_eq!(config.update.repo_owner, "acme");
        assert_eq!(config.update.check_timeout_secs, 10);
        assert_eq!(config.feedback.max_records, 100);
    }
}
