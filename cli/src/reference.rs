use std::fmt;

use crate::errors::{ClientError, Result};
use crate::repos::RepoManager;

pub static MODELX_AUTH_ENV: &str = "MODELX_AUTH";
static SPLITOR_REPO: char = ':';
static SPLITOR_VERSION: char = '@';

/// A resolved `(registry, repository, version)` tuple plus the bearer
/// authorization to use against it. Version "" means the repository itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub version: String,
    pub authorization: Option<String>,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}/{}", self.registry, self.repository)
        } else {
            write!(f, "{}/{}@{}", self.registry, self.repository, self.version)
        }
    }
}

/// Accepted forms:
///   scheme://host[:port][/repo[@version]]
///   alias[:repo[@version]]     alias resolved via the repos file
///   host/repo[@version]        https:// is prepended
///
/// A single-segment repository is prefixed with `library/`. A `?token=`
/// query parameter overrides the alias token; MODELX_AUTH overrides both.
pub fn parse_reference(raw: &str, repos: &RepoManager) -> Result<Reference> {
    let mut raw = raw.to_string();
    let mut authorization: Option<String> = None;

    if !raw.contains("://") {
        let (alias, rest) = match raw.split_once(SPLITOR_REPO) {
            Some((alias, rest)) => (alias, Some(rest)),
            None => (raw.as_str(), None),
        };
        if let Ok(details) = repos.get(alias) {
            if !details.token.is_empty() {
                authorization = Some(format!("Bearer {}", details.token));
            }
            raw = match rest {
                Some(rest) => format!("{}/{}", details.url.trim_end_matches('/'), rest),
                None => details.url.clone(),
            };
        } else {
            raw = format!("https://{raw}");
        }
    }

    let url = url::Url::parse(&raw)
        .map_err(|e| ClientError::InvalidReference(format!("{raw}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| ClientError::InvalidReference(format!("{raw}: missing host")))?;
    let registry = match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };

    if let Some(token) = url
        .query_pairs()
        .find_map(|(k, v)| (k == "token").then(|| v.to_string()))
    {
        if !token.is_empty() {
            authorization = Some(format!("Bearer {token}"));
        }
    }
    if let Ok(auth) = std::env::var(MODELX_AUTH_ENV) {
        if !auth.is_empty() {
            authorization = Some(auth);
        }
    }

    let path = url.path().trim_start_matches('/');
    let (mut repository, version) = match path.rsplit_once(SPLITOR_VERSION) {
        Some((repository, version)) => (repository.to_string(), version.to_string()),
        None => (path.to_string(), String::new()),
    };
    if !repository.is_empty() && !repository.contains('/') {
        repository = format!("library/{repository}");
    }
    if !repository.is_empty() && !shared::is_valid_repository_name(&repository) {
        return Err(ClientError::InvalidReference(format!(
            "repository: {repository}"
        )));
    }
    if !version.is_empty() && !shared::is_valid_reference(&version) {
        return Err(ClientError::InvalidReference(format!("version: {version}")));
    }

    Ok(Reference {
        registry,
        repository,
        version,
        authorization,
    })
}
