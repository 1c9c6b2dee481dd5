//! Read-only release lookup against the GitHub REST API.
//!
//! Consulted during approval (does the release exist, is it a draft or
//! prerelease) and during fetch verification (which commit does the tag
//! point at). Never used for execution.

use std::sync::OnceLock;
use std::time::Duration;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

const DEFAULT_GITHUB_API_BASE_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("billy-lifecycle/", env!("CARGO_PKG_VERSION"));

/// Errors from release lookups.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("GitHub API request failed{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Http { status: Option<u16>, message: String },

    #[error("unexpected GitHub API response: {0}")]
    Decode(String),
}

/// Release metadata needed by the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub tag_name: String,
    pub html_url: String,
    pub draft: bool,
    pub prerelease: bool,
    #[serde(default)]
    pub published_at: Option<String>,
}

impl ReleaseInfo {
    pub fn is_stable(&self) -> bool {
        !self.draft && !self.prerelease
    }
}

/// Source of release information. Implementations must be read-only.
pub trait ReleaseSource: Send + Sync {
    /// Look up a release by tag. `Ok(None)` when the tag has no release.
    fn release_by_tag(&self, tag: &str) -> Result<Option<ReleaseInfo>, GitHubError>;

    /// Commit SHA the tag resolves to. `Ok(None)` when the tag is unknown.
    fn tag_commit(&self, tag: &str) -> Result<Option<String>, GitHubError>;
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    sha: String,
}

/// Blocking GitHub REST client for one repository.
pub struct GitHubReleaseClient {
    owner: String,
    repo: String,
    api_base_url: String,
    token: Option<String>,
    http_client: reqwest::blocking::Client,
}

impl GitHubReleaseClient {
    /// Create a client against the public API.
    pub fn new(owner: &str, repo: &str, token: Option<String>) -> Result<Self, GitHubError> {
        Self::with_api_base_url(owner, repo, token, DEFAULT_GITHUB_API_BASE_URL)
    }

    /// Create a client against an explicit API base URL (GitHub Enterprise).
    pub fn with_api_base_url(
        owner: &str,
        repo: &str,
        token: Option<String>,
        api_base_url: &str,
    ) -> Result<Self, GitHubError> {
        validate_slug("owner", owner)?;
        validate_slug("repo", repo)?;
        if api_base_url.trim().is_empty() {
            return Err(GitHubError::InvalidInput {
                field: "api_base_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let http_client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| GitHubError::Http {
                status: None,
                message: error.to_string(),
            })?;

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            http_client,
        })
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>, GitHubError> {
        let url = format!(
            "{}/repos/{}/{}/{}",
            self.api_base_url, self.owner, self.repo, path
        );
        tracing::debug!(%url, "GitHub API request");

        let mut request = self
            .http_client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|error| GitHubError::Http {
            status: None,
            message: error.to_string(),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GitHubError::Http {
                status: Some(status.as_u16()),
                message: body.chars().take(200).collect(),
            });
        }

        response
            .json::<T>()
            .map(Some)
            .map_err(|e| GitHubError::Decode(e.to_string()))
    }
}

impl ReleaseSource for GitHubReleaseClient {
    fn release_by_tag(&self, tag: &str) -> Result<Option<ReleaseInfo>, GitHubError> {
        validate_tag(tag)?;
        self.get_json(&format!("releases/tags/{}", tag))
    }

    fn tag_commit(&self, tag: &str) -> Result<Option<String>, GitHubError> {
        validate_tag(tag)?;
        // /commits/{ref} peels annotated tags down to the commit.
        let commit: Option<ApiCommit> = self.get_json(&format!("commits/{}", tag))?;
        match commit {
            Some(c) if is_commit_sha(&c.sha) => Ok(Some(c.sha.to_lowercase())),
            Some(c) => Err(GitHubError::Decode(format!("malformed commit sha '{}'", c.sha))),
            None => Ok(None),
        }
    }
}

fn compiled<'a>(
    cell: &'a OnceLock<Option<Regex>>,
    pattern: &str,
) -> Result<&'a Regex, GitHubError> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| GitHubError::Decode(format!("invalid pattern {}", pattern)))
}

fn validate_slug(field: &str, value: &str) -> Result<(), GitHubError> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = compiled(&PATTERN, r"^[A-Za-z0-9][A-Za-z0-9._-]{0,99}$")?;
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(GitHubError::InvalidInput {
            field: field.to_string(),
            reason: format!("'{}' is not a valid GitHub name", value),
        })
    }
}

fn validate_tag(tag: &str) -> Result<(), GitHubError> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = compiled(&PATTERN, r"^[A-Za-z0-9][A-Za-z0-9._+-]{0,127}$")?;
    if pattern.is_match(tag) {
        Ok(())
    } else {
        Err(GitHubError::InvalidInput {
            field: "tag".to_string(),
            reason: format!("'{}' is not a valid tag name", tag),
        })
    }
}

/// Whether `sha` looks like a full 40-char hex commit id.
pub fn is_commit_sha(sha: &str) -> bool {
    sha.len() == 40 && sha.chars().all(|c| c.is_ascii_hexdigit())
}
