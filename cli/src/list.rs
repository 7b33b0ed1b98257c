use shared::ANNOTATION_DESCRIPTION;

use crate::client::Client;
use crate::errors::Result;
use crate::reference::Reference;
use crate::units::human_size;

/// Tabular output for the list command.
pub struct ShowList {
    pub header: Vec<&'static str>,
    pub items: Vec<Vec<String>>,
}

impl ShowList {
    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.header.iter().map(|h| h.len()).collect();
        for row in &self.items {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() {
                    widths[i] = widths[i].max(cell.len());
                }
            }
        }
        let mut out = String::new();
        let render_row = |row: &[String], widths: &[usize], out: &mut String| {
            for (i, cell) in row.iter().enumerate() {
                if i > 0 {
                    out.push_str("  ");
                }
                out.push_str(&format!("{:<width$}", cell, width = widths[i]));
            }
            out.push('\n');
        };
        let header: Vec<String> = self.header.iter().map(|h| h.to_string()).collect();
        render_row(&header, &widths, &mut out);
        for row in &self.items {
            render_row(row, &widths, &mut out);
        }
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

fn description(annotations: &Option<std::collections::HashMap<String, String>>) -> String {
    annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_DESCRIPTION))
        .cloned()
        .unwrap_or_default()
}

impl Client {
    /// How much of the reference is present selects the table: none →
    /// repositories, repository → versions, repository@version → files.
    pub async fn list(&self, reference: &Reference, search: &str) -> Result<ShowList> {
        match (
            reference.repository.is_empty(),
            reference.version.is_empty(),
        ) {
            (true, _) => self.list_repositories(reference, search).await,
            (false, true) => self.list_versions(reference, search).await,
            (false, false) => self.list_files(reference).await,
        }
    }

    async fn list_repositories(
        &self,
        reference: &Reference,
        search: &str,
    ) -> Result<ShowList> {
        let index = self.remote.get_global_index(search).await?;
        Ok(ShowList {
            header: vec!["Repository", "URL", "Description"],
            items: index
                .manifests
                .iter()
                .map(|repo| {
                    vec![
                        repo.name.clone(),
                        format!("{}/{}", reference.registry, repo.name),
                        description(&repo.annotations),
                    ]
                })
                .collect(),
        })
    }

    async fn list_versions(&self, reference: &Reference, search: &str) -> Result<ShowList> {
        let index = self
            .remote
            .get_index(&reference.repository, search)
            .await?;
        Ok(ShowList {
            header: vec!["Version", "URL", "Description"],
            items: index
                .manifests
                .iter()
                .map(|version| {
                    vec![
                        version.name.clone(),
                        format!(
                            "{}/{}@{}",
                            reference.registry, reference.repository, version.name
                        ),
                        description(&version.annotations),
                    ]
                })
                .collect(),
        })
    }

    async fn list_files(&self, reference: &Reference) -> Result<ShowList> {
        let manifest = self
            .remote
            .get_manifest(&reference.repository, &reference.version)
            .await?;
        Ok(ShowList {
            header: vec!["Name", "Digest", "Size"],
            items: manifest
                .blobs
                .iter()
                .chain(std::iter::once(&manifest.config))
                .map(|blob| {
                    vec![
                        blob.name.clone(),
                        blob.digest.to_string(),
                        human_size(blob.size as f64),
                    ]
                })
                .collect(),
        })
    }
}
