use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use super::EvidenceFetcher;

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// A GitHub profile, optionally narrowed to one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRef {
    pub owner: String,
    pub repo: Option<String>,
}

/// Parse a GitHub reference from a profile or repository URL.
///
/// Handles:
/// - `https://github.com/owner`
/// - `https://github.com/owner/repo` (with optional `.git` or trailing path)
/// - `github.com/owner` without a scheme
/// - a bare `owner` login
pub fn parse_github_ref(source_ref: &str) -> Option<GitHubRef> {
    let trimmed = source_ref.trim().trim_end_matches('/');
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let without_www = without_scheme
        .strip_prefix("www.")
        .unwrap_or(without_scheme);

    let path = match without_www.strip_prefix("github.com/") {
        Some(path) => path,
        // Anything else that looks like a URL is not a GitHub reference.
        None if without_www.contains('/') || without_www.contains('.') => return None,
        None => without_www,
    };

    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    if !is_valid_login(owner) {
        return None;
    }
    let repo = parts
        .next()
        .map(|r| r.strip_suffix(".git").unwrap_or(r).to_string())
        .filter(|r| !r.is_empty());

    Some(GitHubRef {
        owner: owner.to_string(),
        repo,
    })
}

fn is_valid_login(login: &str) -> bool {
    !login.is_empty()
        && login.len() <= 39
        && !login.starts_with('-')
        && login.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
    name: Option<String>,
    bio: Option<String>,
    public_repos: Option<u32>,
    followers: Option<u32>,
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    full_name: String,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u32,
    #[serde(default)]
    fork: bool,
    pushed_at: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
}

/// Evidence fetcher for public GitHub activity.
pub struct GitHubEvidenceFetcher {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    max_repos: usize,
}

impl GitHubEvidenceFetcher {
    pub fn new(
        api_url: &str,
        token: Option<String>,
        timeout: Duration,
        max_repos: usize,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("tryout-evidence")
            .build()
            .context("Failed to build GitHub HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            max_repos,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let mut request = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .header("Accept", "application/vnd.github+json")
            .query(query);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        request
            .send()
            .await
            .with_context(|| format!("Failed to send request to GitHub {}", path))?
            .error_for_status()
            .with_context(|| format!("GitHub {} returned error status", path))?
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse GitHub {} response", path))
    }

    async fn collect(&self, github: &GitHubRef) -> anyhow::Result<String> {
        let user: GitHubUser = self
            .get_json(&format!("/users/{}", github.owner), &[])
            .await?;

        let mut repos: Vec<GitHubRepo> = self
            .get_json(
                &format!("/users/{}/repos", github.owner),
                &[
                    ("sort", "pushed".to_string()),
                    ("per_page", self.max_repos.max(1).to_string()),
                ],
            )
            .await?;

        if let Some(repo) = &github.repo {
            // A missing or private focus repo still leaves the profile summary.
            match self
                .get_json::<GitHubRepo>(&format!("/repos/{}/{}", github.owner, repo), &[])
                .await
            {
                Ok(focus) => {
                    repos.retain(|r| r.full_name != focus.full_name);
                    repos.insert(0, focus);
                }
                Err(e) => {
                    tracing::warn!(owner = %github.owner, repo = %repo, error = %format!("{:#}", e), "GitHub focus repository lookup failed");
                }
            }
        }
        repos.truncate(self.max_repos);

        Ok(render_summary(&user, &repos))
    }
}

fn render_summary(user: &GitHubUser, repos: &[GitHubRepo]) -> String {
    let mut out = format!("GitHub profile: {}", user.login);
    if let Some(name) = &user.name {
        out.push_str(&format!(" ({})", name));
    }
    out.push('\n');
    if let Some(bio) = user.bio.as_deref().filter(|b| !b.trim().is_empty()) {
        out.push_str(&format!("Bio: {}\n", bio.trim()));
    }
    out.push_str(&format!(
        "Public repositories: {}, followers: {}",
        user.public_repos.unwrap_or(0),
        user.followers.unwrap_or(0)
    ));
    if let Some(created) = &user.created_at {
        out.push_str(&format!(", account created {}", created));
    }
    out.push('\n');

    if repos.is_empty() {
        out.push_str("No public repositories found.\n");
        return out;
    }

    out.push_str("Recently pushed repositories:\n");
    for repo in repos {
        out.push_str(&format!("- {}", repo.full_name));
        if repo.fork {
            out.push_str(" (fork)");
        }
        if let Some(lang) = &repo.language {
            out.push_str(&format!(" [{}]", lang));
        }
        if repo.stargazers_count > 0 {
            out.push_str(&format!(" {} stars", repo.stargazers_count));
        }
        if let Some(pushed) = &repo.pushed_at {
            out.push_str(&format!(", last push {}", pushed));
        }
        if let Some(desc) = repo.description.as_deref().filter(|d| !d.trim().is_empty()) {
            out.push_str(&format!(": {}", desc.trim()));
        }
        if !repo.topics.is_empty() {
            out.push_str(&format!(" (topics: {})", repo.topics.join(", ")));
        }
        out.push('\n');
    }
    out
}

#[async_trait]
impl EvidenceFetcher for GitHubEvidenceFetcher {
    async fn fetch(&self, source_ref: &str) -> Option<String> {
        let Some(github) = parse_github_ref(source_ref) else {
            tracing::info!(source_ref, "Evidence source is not a GitHub reference; skipping");
            return None;
        };
        match self.collect(&github).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::warn!(source_ref, error = %format!("{:#}", e), "GitHub evidence fetch failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;

    // ── parse_github_ref ─────────────────────────────────────────────

    #[test]
    fn test_parse_profile_url() {
        assert_eq!(
            parse_github_ref("https://github.com/alice"),
            Some(GitHubRef {
                owner: "alice".into(),
                repo: None
            })
        );
    }

    #[test]
    fn test_parse_repo_url_with_git_suffix() {
        assert_eq!(
            parse_github_ref("https://github.com/alice/todo-api.git"),
            Some(GitHubRef {
                owner: "alice".into(),
                repo: Some("todo-api".into())
            })
        );
    }

    #[test]
    fn test_parse_repo_url_with_trailing_path() {
        let parsed = parse_github_ref("https://github.com/alice/todo-api/tree/main/src").unwrap();
        assert_eq!(parsed.repo.as_deref(), Some("todo-api"));
    }

    #[test]
    fn test_parse_without_scheme_and_bare_login() {
        assert_eq!(parse_github_ref("github.com/bob/").unwrap().owner, "bob");
        assert_eq!(parse_github_ref("carol-dev").unwrap().owner, "carol-dev");
    }

    #[test]
    fn test_parse_rejects_other_hosts() {
        assert_eq!(parse_github_ref("https://gitlab.com/alice"), None);
        assert_eq!(parse_github_ref("https://alice.dev"), None);
        assert_eq!(parse_github_ref(""), None);
        assert_eq!(parse_github_ref("https://github.com/-bad"), None);
    }

    // ── fetch ────────────────────────────────────────────────────────

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fake_github() -> Router {
        Router::new()
            .route(
                "/users/{login}",
                get(|Path(login): Path<String>| async move {
                    if login != "alice" {
                        return Err(StatusCode::NOT_FOUND);
                    }
                    Ok(axum::Json(serde_json::json!({
                        "login": "alice",
                        "name": "Alice Example",
                        "bio": "Backend engineer",
                        "public_repos": 12,
                        "followers": 40,
                        "created_at": "2019-03-01T00:00:00Z"
                    })))
                }),
            )
            .route(
                "/users/{login}/repos",
                get(|| async {
                    axum::Json(serde_json::json!([
                        {"full_name": "alice/queue", "description": "A job queue", "language": "Rust",
                         "stargazers_count": 3, "fork": false, "pushed_at": "2026-09-01T00:00:00Z",
                         "topics": ["queue"]},
                        {"full_name": "alice/dotfiles", "description": null, "language": null,
                         "stargazers_count": 0, "fork": true, "pushed_at": "2026-08-01T00:00:00Z"}
                    ]))
                }),
            )
            .route(
                "/repos/{owner}/{repo}",
                get(|Path((owner, repo)): Path<(String, String)>| async move {
                    if owner != "alice" || repo != "todo-api" {
                        return Err(StatusCode::NOT_FOUND);
                    }
                    Ok(axum::Json(serde_json::json!({
                        "full_name": "alice/todo-api", "description": "Todo service", "language": "Go",
                        "stargazers_count": 0, "fork": false, "pushed_at": "2025-01-01T00:00:00Z"
                    })))
                }),
            )
    }

    #[tokio::test]
    async fn test_fetch_summarizes_profile_and_repos() {
        let url = serve(fake_github()).await;
        let fetcher = GitHubEvidenceFetcher::new(&url, None, Duration::from_secs(5), 5).unwrap();
        let summary = fetcher.fetch("https://github.com/alice").await.unwrap();
        assert!(summary.contains("GitHub profile: alice (Alice Example)"));
        assert!(summary.contains("Bio: Backend engineer"));
        assert!(summary.contains("- alice/queue [Rust] 3 stars"));
        assert!(summary.contains("alice/dotfiles (fork)"));
    }

    #[tokio::test]
    async fn test_fetch_puts_focus_repo_first() {
        let url = serve(fake_github()).await;
        let fetcher = GitHubEvidenceFetcher::new(&url, None, Duration::from_secs(5), 5).unwrap();
        let summary = fetcher.fetch("https://github.com/alice/todo-api").await.unwrap();
        let focus = summary.find("- alice/todo-api [Go]").unwrap();
        let recent = summary.find("- alice/queue").unwrap();
        assert!(focus < recent);
    }

    #[tokio::test]
    async fn test_fetch_missing_focus_repo_keeps_profile() {
        let url = serve(fake_github()).await;
        let fetcher = GitHubEvidenceFetcher::new(&url, None, Duration::from_secs(5), 5).unwrap();
        let summary = fetcher.fetch("https://github.com/alice/deleted-repo").await.unwrap();
        assert!(summary.contains("GitHub profile: alice (Alice Example)"));
        assert!(summary.contains("- alice/queue [Rust] 3 stars"));
        assert!(!summary.contains("deleted-repo"));
    }

    #[tokio::test]
    async fn test_fetch_unknown_user_is_none() {
        let url = serve(fake_github()).await;
        let fetcher = GitHubEvidenceFetcher::new(&url, None, Duration::from_secs(5), 5).unwrap();
        assert!(fetcher.fetch("https://github.com/nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_non_github_ref_is_none() {
        let fetcher =
            GitHubEvidenceFetcher::new("http://127.0.0.1:9", None, Duration::from_secs(1), 5)
                .unwrap();
        assert!(fetcher.fetch("https://linkedin.com/in/alice").await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_unreachable_api_is_none() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fetcher = GitHubEvidenceFetcher::new(
            &format!("http://{}", addr),
            None,
            Duration::from_secs(1),
            5,
        )
        .unwrap();
        assert!(fetcher.fetch("alice").await.is_none());
    }
}
