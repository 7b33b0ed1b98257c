use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{ClientError, Result};

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct RepoFile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoDetails>,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct RepoDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

/// Registry aliases persisted at `~/.modelx/repos.json`. Readers tolerate
/// a missing file; writers create the directory as needed.
pub struct RepoManager {
    pub path: PathBuf,
}

impl RepoManager {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".modelx")
            .join("repos.json")
    }

    pub fn set(&self, item: RepoDetails) -> Result<()> {
        url::Url::parse(&item.url)
            .map_err(|_| ClientError::Other(format!("invalid url: {}", item.url)))?;
        let mut file = self.load()?;
        match file.repos.iter_mut().find(|r| r.name == item.name) {
            Some(existing) => *existing = item,
            None => file.repos.push(item),
        }
        self.save(&file)
    }

    pub fn get(&self, name: &str) -> Result<RepoDetails> {
        self.load()?
            .repos
            .into_iter()
            .find(|r| r.name == name || r.url == name)
            .ok_or_else(|| ClientError::Other(format!("repo {name} not found")))
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut file = self.load()?;
        let before = file.repos.len();
        file.repos.retain(|r| r.name != name);
        if file.repos.len() == before {
            return Err(ClientError::Other(format!("repo {name} not found")));
        }
        self.save(&file)
    }

    pub fn list(&self) -> Vec<RepoDetails> {
        self.load().map(|f| f.repos).unwrap_or_default()
    }

    fn load(&self) -> Result<RepoFile> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RepoFile::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    fn save(&self, file: &RepoFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_vec_pretty(file)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}
