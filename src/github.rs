use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use octocrab::models::Repository as GitHubRepository;
use octocrab::Octocrab;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{GitHubSourceConfig, ProviderOptions};
use crate::git::GitRepository;
use crate::source::{matches_exclusion_pattern, Repository, RepositorySource};

/// Username GitHub accepts alongside a token for HTTPS git access
const TOKEN_USERNAME: &str = "x-access-token";

const DEFAULT_API_URL: &str = "https://api.github.com";

const PAGE_SIZE: u8 = 100;

/// How requests reach the REST API
enum ApiClient {
    Octocrab(Octocrab),
    /// octocrab can't skip certificate checks, so `--insecure` goes through
    /// a plain reqwest client instead
    Insecure {
        client: reqwest::Client,
        base_url: String,
    },
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
}

/// A GitHub (or GitHub Enterprise) account backed by the REST API
pub struct GitHubSource {
    name: String,
    api: ApiClient,
    token: String,
    exclude: Vec<String>,
    options: ProviderOptions,
}

impl GitHubSource {
    /// Create a new GitHub source from its configuration entry
    pub fn new(config: &GitHubSourceConfig, options: &ProviderOptions) -> Result<Self> {
        let api = if options.insecure {
            let client = reqwest::Client::builder()
                .user_agent(concat!("git-backup/", env!("CARGO_PKG_VERSION")))
                .danger_accept_invalid_certs(true)
                .build()
                .context("Failed to create GitHub client")?;

            ApiClient::Insecure {
                client,
                base_url: config
                    .url
                    .as_deref()
                    .unwrap_or(DEFAULT_API_URL)
                    .trim_end_matches('/')
                    .to_string(),
            }
        } else {
            let mut builder = Octocrab::builder().personal_token(config.access_token.clone());

            if let Some(url) = &config.url {
                builder = builder
                    .base_uri(url.as_str())
                    .with_context(|| format!("Invalid GitHub API URL: {}", url))?;
            }

            ApiClient::Octocrab(builder.build().context("Failed to create GitHub client")?)
        };

        Ok(Self {
            name: config.job_name.clone(),
            api,
            token: config.access_token.clone(),
            exclude: config.exclude.clone(),
            options: options.clone(),
        })
    }

    /// `GET` an API endpoint through the certificate-skipping client
    async fn get_insecure<T: DeserializeOwned>(
        &self,
        client: &reqwest::Client,
        url: String,
        query: &[(&str, String)],
    ) -> Result<T> {
        debug!("Sending request to {}", url);

        let response = client
            .get(&url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .query(query)
            .send()
            .await
            .with_context(|| format!("Unable to send request to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Request to {} failed with {}: {}", url, status, body.trim());
        }

        response
            .json()
            .await
            .with_context(|| format!("Unable to deserialize response from {}", url))
    }

    async fn current_user_login(&self) -> Result<String> {
        match &self.api {
            ApiClient::Octocrab(client) => Ok(client.current().user().await?.login),
            ApiClient::Insecure { client, base_url } => {
                let user: GitHubUser = self
                    .get_insecure(client, format!("{}/user", base_url), &[])
                    .await?;
                Ok(user.login)
            }
        }
    }

    async fn repositories_page(&self, page: u8) -> Result<Vec<GitHubRepository>> {
        match &self.api {
            ApiClient::Octocrab(client) => Ok(client
                .current()
                .list_repos_for_authenticated_user()
                .per_page(PAGE_SIZE)
                .page(page)
                .send()
                .await?
                .items),
            ApiClient::Insecure { client, base_url } => {
                self.get_insecure(
                    client,
                    format!("{}/user/repos", base_url),
                    &[
                        ("per_page", PAGE_SIZE.to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await
            }
        }
    }

    /// List all repositories visible to the authenticated user
    ///
    /// This covers owned repositories, collaborations and organization
    /// memberships.
    async fn list_user_repositories(&self) -> Result<Vec<GitHubRepository>> {
        let mut repositories = Vec::new();
        let mut page = 1u8;

        loop {
            let items = self
                .repositories_page(page)
                .await
                .with_context(|| format!("Failed to fetch repositories page {}", page))?;

            if items.is_empty() {
                break;
            }

            repositories.extend(items);

            // GitHub API pagination limit for u8
            if page == u8::MAX {
                bail!("Repository listing exceeded {} pages", u8::MAX);
            }
            page += 1;
        }

        Ok(repositories)
    }

    /// Convert octocrab Repository to a clonable handle
    fn to_git_repository(&self, repo: &GitHubRepository) -> Result<GitRepository> {
        let full_name = match (&repo.full_name, &repo.owner) {
            (Some(full_name), _) => full_name.clone(),
            (None, Some(owner)) => format!("{}/{}", owner.login, repo.name),
            (None, None) => repo.name.clone(),
        };

        let clone_url = repo
            .clone_url
            .as_ref()
            .map(|url| url.to_string())
            .or_else(|| repo.html_url.as_ref().map(|url| format!("{}.git", url)))
            .ok_or_else(|| anyhow!("Repository {} has no clone URL", full_name))?;

        Ok(GitRepository::new(full_name, clone_url)
            .with_credentials(TOKEN_USERNAME, self.token.clone())
            .insecure(self.options.insecure)
            .with_timeout(self.options.git_timeout))
    }
}

#[async_trait]
impl RepositorySource for GitHubSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test(&self) -> Result<()> {
        let login = self
            .current_user_login()
            .await
            .context("Failed to get current user information. Check your access token.")?;

        info!("[{}] Authenticated as GitHub user: {}", self.name, login);
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<Box<dyn Repository>>> {
        let repositories = self.list_user_repositories().await?;
        debug!(
            "[{}] Found {} repositories before filtering",
            self.name,
            repositories.len()
        );

        let mut handles: Vec<Box<dyn Repository>> = Vec::new();

        for repo in &repositories {
            let handle = self.to_git_repository(repo)?;

            if matches_exclusion_pattern(handle.full_name(), &self.exclude) {
                debug!("Excluding repository due to pattern match: {}", handle.full_name());
                continue;
            }

            handles.push(Box::new(handle));
        }

        Ok(handles)
    }
}
