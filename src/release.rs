//! Release index client.
//!
//! Queries the GitHub "latest release" endpoint and resolves the newest
//! published version together with the downloadable asset for this platform.

use crate::config::UpdateSettings;
use crate::download;
use crate::errors::UpdateError;
use crate::version::parse_tag;
use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const GITHUB_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A resolved release: immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub version: Version,
    pub asset_url: String,
    pub asset_name: String,
    pub asset_size: Option<u64>,
}

/// Where releases come from. The orchestrator only ever talks to this seam,
/// so tests can drive the full state machine without a network.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest(&self) -> Result<ReleaseInfo, UpdateError>;
    async fn fetch(&self, release: &ReleaseInfo, dest: &Path) -> Result<u64, UpdateError>;
}

pub struct ReleaseClient {
    http: reqwest::Client,
    settings: UpdateSettings,
    api_base: String,
}

impl ReleaseClient {
    pub fn new(settings: UpdateSettings) -> Result<Self, UpdateError> {
        Self::with_api_base(settings, GITHUB_API_BASE)
    }

    pub fn with_api_base(
        settings: UpdateSettings,
        api_base: impl Into<String>,
    ) -> Result<Self, UpdateError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.check_timeout_secs))
            .build()
            .map_err(UpdateError::from_http)?;
        Ok(Self {
            http,
            settings,
            api_base: api_base.into(),
        })
    }

    fn latest_release_url(&self) -> String {
        format!(
            "{}/repos/{}/releases/latest",
            self.api_base,
            self.settings.full_repo()
        )
    }
}

/// Pick the asset whose name matches the expected executable for this
/// platform. Exact match wins; a `.exe`-suffixed variant is accepted so one
/// config works across platforms.
pub fn select_asset(release: &GitHubRelease, executable_name: &str) -> Option<GitHubAsset> {
    release
        .assets
        .iter()
        .find(|a| a.name == executable_name)
        .or_else(|| {
            release
                .assets
                .iter()
                .find(|a| a.name == format!("{}.exe", executable_name))
        })
        .cloned()
}

pub fn resolve_release(
    release: &GitHubRelease,
    executable_name: &str,
) -> Result<ReleaseInfo, UpdateError> {
    let version = parse_tag(&release.tag_name)?;
    let asset = select_asset(release, executable_name)
        .ok_or_else(|| UpdateError::AssetMissing(executable_name.to_string()))?;
    Ok(ReleaseInfo {
        version,
        asset_url: asset.browser_download_url,
        asset_name: asset.name,
        asset_size: asset.size,
    })
}

#[async_trait]
impl ReleaseSource for ReleaseClient {
    async fn latest(&self) -> Result<ReleaseInfo, UpdateError> {
        let url = self.latest_release_url();
        tracing::debug!("Fetching release info from: {}", url);

        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", concat!("upkeep/", env!("CARGO_PKG_VERSION")));

        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            request = request.header("Authorization", format!("token {}", token));
            tracing::debug!("Using GITHUB_TOKEN");
        }

        let response = request.send().await.map_err(UpdateError::from_http)?;
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "release index request failed for {}: {}",
                self.settings.full_repo(),
                response.status()
            )));
        }

        let release: GitHubRelease = response.json().await.map_err(UpdateError::from_http)?;
        resolve_release(&release, &self.settings.executable_name)
    }

    async fn fetch(&self, release: &ReleaseInfo, dest: &Path) -> Result<u64, UpdateError> {
        download::fetch(
            &release.asset_url,
            dest,
            Duration::from_secs(self.settings.download_timeout_secs),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn release_json(tag: &str) -> serde_json::Value {
        serde_json::json!({
            "tag_name": tag,
            "assets": [
                {"name": "checksums.txt", "browser_download_url": "https://example.com/sums", "size": 128},
                {"name": "scanner", "browser_download_url": "https://example.com/scanner", "size": 4096}
            ]
        })
    }

    fn settings() -> UpdateSettings {
        UpdateSettings {
            repo_owner: "acme".into(),
            repo_name: "scanner".into(),
            executable_name: "scanner".into(),
            ..Default::default()
        }
    }

    #[test]
    fn selects_asset_by_exact_name() {
        let release: GitHubRelease = serde_json::from_value(release_json("v1.0.1")).unwrap();
        let asset = select_asset(&release, "scanner").unwrap();
        assert_eq!(asset.name, "scanner");
        assert_eq!(asset.size, Some(4096));
    }

    #[test]
    fn falls_back_to_exe_suffix() {
        let release = GitHubRelease {
            tag_name: "v2.0.0".into(),
            assets: vec![GitHubAsset {
                name: "scanner.exe".into(),
                browser_download_url: "https://example.com/scanner.exe".into(),
                size: None,
            }],
            body: None,
        };
        assert!(select_asset(&release, "scanner").is_some());
    }

    #[test]
    fn resolve_rejects_bad_tag_as_parse() {
        let release: GitHubRelease = serde_json::from_value(release_json("nightly")).unwrap();
        assert!(matches!(
            resolve_release(&release, "scanner"),
            Err(UpdateError::Parse(_))
        ));
    }

    #[test]
    fn resolve_rejects_missing_asset() {
        let release: GitHubRelease = serde_json::from_value(release_json("v1.0.1")).unwrap();
        assert!(matches!(
            resolve_release(&release, "other-tool"),
            Err(UpdateError::AssetMissing(_))
        ));
    }

    #[tokio::test]
    async fn latest_resolves_from_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/scanner/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json("v1.0.1")))
            .mount(&server)
            .await;

        let client = ReleaseClient::with_api_base(settings(), server.uri()).unwrap();
        let info = client.latest().await.unwrap();
        assert_eq!(info.version, Version::new(1, 0, 1));
        assert_eq!(info.asset_name, "scanner");
    }

    #[tokio::test]
    async fn http_failure_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/scanner/releases/latest"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ReleaseClient::with_api_base(settings(), server.uri()).unwrap();
        assert!(matches!(
            client.latest().await,
            Err(UpdateError::Network(_))
        ));
    }

    #[tokio::test]
    async fn malformed_tag_is_parse_error_not_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/scanner/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json("not-semver")))
            .mount(&server)
            .await;

        let client = ReleaseClient::with_api_base(settings(), server.uri()).unwrap();
        assert!(matches!(client.latest().await, Err(UpdateError::Parse(_))));
    }
}
