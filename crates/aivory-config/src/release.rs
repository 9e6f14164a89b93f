//! Release/git context resolution.
//!
//! Explicit settings (agent args, properties, `AIVORY_*` env vars) win;
//! otherwise well-known CI and PaaS environment variables are consulted.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;

/// Release context attached to `register` and `exception` payloads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseContext {
    pub commit_hash: String,
    pub commit_short: String,
    pub branch: String,
    pub remote_url: String,
    pub version: String,
    pub project_name: String,
    pub project_identifier: String,
    pub source: String,
    pub captured_at: String,
}

/// Raw release settings accumulated while parsing config sources.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReleaseSettings {
    pub release: Option<String>,
    pub version: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub repository: Option<String>,
}

impl ReleaseSettings {
    /// Resolves the final context, or `None` when no source produced any
    /// version information at all.
    pub fn resolve(&self, env: &HashMap<String, String>) -> Option<ReleaseContext> {
        let mut version = self.version.clone();
        let mut commit = self.commit.clone();

        // `release` alone may encode "name@version", a bare commit SHA, or
        // a bare version string.
        if let Some(release) = self.release.as_deref().filter(|r| !r.is_empty()) {
            if version.is_none() {
                if let Some(at) = release.find('@').filter(|&at| at > 0) {
                    version = Some(release[at + 1..].to_string());
                } else if looks_like_commit_sha(release) {
                    if commit.is_none() {
                        commit = Some(release.to_string());
                    }
                } else {
                    version = Some(release.to_string());
                }
            }
        }

        if commit.is_none() {
            commit = first_non_empty(
                env,
                &[
                    "HEROKU_SLUG_COMMIT",
                    "VERCEL_GIT_COMMIT_SHA",
                    "CODEBUILD_RESOLVED_SOURCE_VERSION",
                    "CIRCLE_SHA1",
                    "GITHUB_SHA",
                    "CI_COMMIT_SHA",
                    "GIT_COMMIT",
                    "SOURCE_VERSION",
                ],
            );
        }

        let mut branch = self.branch.clone();
        if branch.is_none() {
            branch = first_non_empty(
                env,
                &[
                    "VERCEL_GIT_COMMIT_REF",
                    "CIRCLE_BRANCH",
                    "GITHUB_REF_NAME",
                    "CI_COMMIT_BRANCH",
                    "CI_COMMIT_TAG",
                ],
            );
        }

        let mut repository = self.repository.clone();
        if repository.is_none() {
            repository = detect_repository(env);
        }

        if version.is_none() {
            version = first_non_empty(env, &["HEROKU_RELEASE_VERSION", "APP_VERSION"]);
        }

        if version.is_none() && commit.is_none() && branch.is_none() && repository.is_none() {
            return None;
        }

        let (project_identifier, project_name) = repository
            .as_deref()
            .map(extract_project)
            .unwrap_or_default();

        let commit_hash = commit.unwrap_or_default();
        let commit_short = if commit_hash.len() >= 7 {
            commit_hash[..7].to_string()
        } else {
            commit_hash.clone()
        };

        Some(ReleaseContext {
            commit_hash,
            commit_short,
            branch: branch.unwrap_or_default(),
            remote_url: repository.unwrap_or_default(),
            version: version.unwrap_or_default(),
            project_name,
            project_identifier,
            source: "agent".to_string(),
            captured_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

fn looks_like_commit_sha(value: &str) -> bool {
    (7..=40).contains(&value.len()) && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn first_non_empty(env: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env.get(*key))
        .find(|value| !value.is_empty())
        .cloned()
}

fn detect_repository(env: &HashMap<String, String>) -> Option<String> {
    let get = |key: &str| env.get(key).filter(|v| !v.is_empty());

    if let (Some(owner), Some(slug)) = (get("VERCEL_GIT_REPO_OWNER"), get("VERCEL_GIT_REPO_SLUG")) {
        return Some(format!("https://github.com/{owner}/{slug}"));
    }
    if let Some(repo) = get("GITHUB_REPOSITORY") {
        return Some(format!("https://github.com/{repo}"));
    }
    if let Some(path) = get("CI_PROJECT_PATH") {
        return Some(format!("https://gitlab.com/{path}"));
    }
    get("CIRCLE_REPOSITORY_URL").cloned()
}

/// Derives `(project_identifier, project_name)` from a repository URL.
fn extract_project(repository: &str) -> (String, String) {
    static REPO_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = REPO_PATTERN
        .get_or_init(|| Regex::new(r"[:/]([^/]+/[^/]+?)(?:\.git)?$").expect("repo pattern"));

    match pattern.captures(repository) {
        Some(captures) => {
            let identifier = captures[1].to_string();
            let name = identifier
                .rsplit('/')
                .next()
                .unwrap_or(identifier.as_str())
                .to_string();
            (identifier, name)
        }
        None => (String::new(), String::new()),
    }
}
