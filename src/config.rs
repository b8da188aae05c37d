use anyhow::{anyhow, bail, Context, Result};
use dirs::config_dir;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::git::DEFAULT_GIT_TIMEOUT;
use crate::github::GitHubSource;
use crate::gitlab::GitLabSource;
use crate::source::{is_valid_source_name, RepositorySource};

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "git-backup.yml";

/// Main configuration structure for git-backup
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// GitHub accounts to back up
    #[serde(default)]
    pub github: Vec<GitHubSourceConfig>,

    /// GitLab accounts to back up
    #[serde(default)]
    pub gitlab: Vec<GitLabSourceConfig>,

    /// Where to upload the finished backup, if anywhere
    #[serde(default)]
    pub upload: Option<UploadConfig>,
}

/// One GitHub account
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubSourceConfig {
    /// Directory name for this account under the backup root
    #[serde(default = "default_github_job_name")]
    pub job_name: String,

    /// Personal access token, `${VAR}` references are expanded
    pub access_token: String,

    /// API base URL for GitHub Enterprise (defaults to api.github.com)
    #[serde(default)]
    pub url: Option<String>,

    /// Glob patterns on `owner/name` to skip
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// One GitLab account
#[derive(Debug, Deserialize, Clone)]
pub struct GitLabSourceConfig {
    /// Directory name for this account under the backup root
    #[serde(default = "default_gitlab_job_name")]
    pub job_name: String,

    /// Personal access token, `${VAR}` references are expanded
    pub access_token: String,

    /// Instance base URL
    #[serde(default = "default_gitlab_url")]
    pub url: String,

    /// Glob patterns on `group/name` to skip
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Blob container the finished backup is uploaded to
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Container URL, including any SAS query string
    pub url: String,
}

/// Run-wide settings every provider receives
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Upper bound for each git invocation
    pub git_timeout: Duration,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            git_timeout: DEFAULT_GIT_TIMEOUT,
        }
    }
}

// Default value functions
fn default_github_job_name() -> String {
    "github.com".to_string()
}
fn default_gitlab_job_name() -> String {
    "gitlab.com".to_string()
}
fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}

impl Config {
    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in secrets and URLs
        config.expand_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Parse YAML without expanding or validating
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_yaml::from_str(content)?)
    }

    /// Pick the config file to use
    ///
    /// An explicit path always wins. Otherwise `git-backup.yml` in the working
    /// directory, then the XDG config location, falling back to the working
    /// directory name so a missing file is reported there.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return local;
        }

        match Self::default_config_path() {
            Ok(path) if path.exists() => path,
            _ => local,
        }
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("git-backup").join("config.yml"))
    }

    /// Expand environment variables in tokens and URLs
    pub fn expand_env(&mut self) -> Result<()> {
        for github in &mut self.github {
            github.access_token = expand(&github.access_token)
                .with_context(|| format!("Failed to expand access_token of [{}]", github.job_name))?;
            if let Some(url) = &github.url {
                github.url = Some(expand(url)?);
            }
        }

        for gitlab in &mut self.gitlab {
            gitlab.access_token = expand(&gitlab.access_token)
                .with_context(|| format!("Failed to expand access_token of [{}]", gitlab.job_name))?;
            gitlab.url = expand(&gitlab.url)?;
        }

        if let Some(upload) = &mut self.upload {
            upload.url = expand(&upload.url).context("Failed to expand upload url")?;
        }

        Ok(())
    }

    /// Check that every source name is usable and unique
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for name in self.source_names() {
            if !is_valid_source_name(name) {
                bail!("Invalid job_name {:?}: must be a single directory name", name);
            }
            if !seen.insert(name) {
                bail!("Duplicate job_name {:?}: every source needs its own", name);
            }
        }

        Ok(())
    }

    /// Names of all configured sources, GitHub first, in file order
    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.github
            .iter()
            .map(|g| g.job_name.as_str())
            .chain(self.gitlab.iter().map(|g| g.job_name.as_str()))
    }

    /// Build every configured source, GitHub first, in file order
    pub fn sources(&self, options: &ProviderOptions) -> Result<Vec<Box<dyn RepositorySource>>> {
        let mut sources: Vec<Box<dyn RepositorySource>> = Vec::new();

        for github in &self.github {
            let source = GitHubSource::new(github, options)
                .with_context(|| format!("Failed to set up [{}]", github.job_name))?;
            sources.push(Box::new(source));
        }

        for gitlab in &self.gitlab {
            let source = GitLabSource::new(gitlab, options)
                .with_context(|| format!("Failed to set up [{}]", gitlab.job_name))?;
            sources.push(Box::new(source));
        }

        Ok(sources)
    }
}

fn expand(value: &str) -> Result<String> {
    shellexpand::full(value)
        .map(|expanded| expanded.into_owned())
        .map_err(|e| anyhow!("{}", e))
}
