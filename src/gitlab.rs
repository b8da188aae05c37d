//! GitLab source backed by the v4 REST API

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{GitLabSourceConfig, ProviderOptions};
use crate::git::GitRepository;
use crate::source::{matches_exclusion_pattern, Repository, RepositorySource};

/// Username GitLab expects alongside a personal access token
const TOKEN_USERNAME: &str = "oauth2";

const PAGE_SIZE: u32 = 100;

/// A GitLab account on gitlab.com or a self-hosted instance
pub struct GitLabSource {
    name: String,
    client: Client,
    base_url: String,
    token: String,
    exclude: Vec<String>,
    options: ProviderOptions,
}

#[derive(Debug, Deserialize)]
struct GitLabUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GitLabProject {
    path_with_namespace: String,
    http_url_to_repo: String,
}

impl GitLabSource {
    pub fn new(config: &GitLabSourceConfig, options: &ProviderOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("git-backup/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(options.insecure)
            .build()
            .context("Failed to create GitLab client")?;

        Ok(Self {
            name: config.job_name.clone(),
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.access_token.clone(),
            exclude: config.exclude.clone(),
            options: options.clone(),
        })
    }

    async fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Response> {
        let url = format!("{}/api/v4{}", self.base_url, endpoint);
        debug!("Sending request to {}", url);

        let response = self
            .client
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Unable to send request to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Request to {} failed with {}: {}", url, status, body.trim());
        }

        Ok(response)
    }

    /// Fetch every project the user is a member of, following `X-Next-Page`.
    async fn list_member_projects(&self) -> Result<Vec<GitLabProject>> {
        let mut projects = Vec::new();
        let mut page = Some(1u32);

        while let Some(current) = page {
            let response = self
                .get(
                    "/projects",
                    &[
                        ("membership", "true".to_string()),
                        ("simple", "true".to_string()),
                        ("per_page", PAGE_SIZE.to_string()),
                        ("page", current.to_string()),
                    ],
                )
                .await
                .with_context(|| format!("Failed to fetch projects page {}", current))?;

            page = next_page(&response)?;

            let items: Vec<GitLabProject> = response
                .json()
                .await
                .with_context(|| format!("Unable to deserialize projects page {}", current))?;
            projects.extend(items);
        }

        Ok(projects)
    }
}

/// The `X-Next-Page` header, empty on the last page.
fn next_page(response: &Response) -> Result<Option<u32>> {
    let Some(value) = response.headers().get("x-next-page") else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|_| anyhow!("X-Next-Page header is not valid text"))?
        .trim();

    if value.is_empty() {
        return Ok(None);
    }

    value
        .parse()
        .map(Some)
        .with_context(|| format!("Invalid X-Next-Page header: {:?}", value))
}

#[async_trait]
impl RepositorySource for GitLabSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test(&self) -> Result<()> {
        let user: GitLabUser = self
            .get("/user", &[])
            .await
            .context("Failed to get current user information. Check your access token.")?
            .json()
            .await
            .context("Unable to deserialize the current user")?;

        info!("[{}] Authenticated as GitLab user: {}", self.name, user.username);
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<Box<dyn Repository>>> {
        let projects = self.list_member_projects().await?;
        debug!(
            "[{}] Found {} projects before filtering",
            self.name,
            projects.len()
        );

        let repositories = projects
            .into_iter()
            .filter(|project| {
                let excluded = matches_exclusion_pattern(&project.path_with_namespace, &self.exclude);
                if excluded {
                    debug!(
                        "Excluding repository due to pattern match: {}",
                        project.path_with_namespace
                    );
                }
                !excluded
            })
            .map(|project| {
                let repo = GitRepository::new(project.path_with_namespace, project.http_url_to_repo)
                    .with_credentials(TOKEN_USERNAME, self.token.clone())
                    .insecure(self.options.insecure)
                    .with_timeout(self.options.git_timeout);
                Box::new(repo) as Box<dyn Repository>
            })
            .collect();

        Ok(repositories)
    }
}
