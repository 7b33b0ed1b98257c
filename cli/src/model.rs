use shared::{Descriptor, ModelConfig, ANNOTATION_DESCRIPTION};
use std::collections::HashMap;
use std::path::Path;

use crate::errors::{ClientError, Result};

pub static MODEL_CONFIG_FILE_NAME: &str = "modelx.yaml";
pub static README_FILE_NAME: &str = "README.md";

/// A local directory mapped to manifest entries, digests still unset.
/// Top-level files become file blobs, top-level directories tar-gz blobs;
/// dot entries are skipped.
pub struct LocalModel {
    pub config: Descriptor,
    pub blobs: Vec<Descriptor>,
    pub annotations: Option<HashMap<String, String>>,
}

pub fn load_model_config(dir: &Path, config_file: &str) -> Result<ModelConfig> {
    let path = dir.join(config_file);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| ClientError::Other(format!("read model config {}: {e}", path.display())))?;
    Ok(serde_yaml::from_str(&raw)?)
}

pub fn scan_directory(dir: &Path, config_file: &str) -> Result<LocalModel> {
    let model_config = load_model_config(dir, config_file)?;
    let mut annotations = model_config.annotations.clone().unwrap_or_default();
    annotations.insert(
        ANNOTATION_DESCRIPTION.to_string(),
        model_config.description.clone(),
    );

    let mut config = None;
    let mut blobs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if name == config_file {
            config = Some(Descriptor {
                name,
                media_type: shared::MEDIA_TYPE_MODEL_CONFIG.to_string(),
                ..Default::default()
            });
        } else if entry.file_type()?.is_dir() {
            blobs.push(Descriptor {
                name,
                media_type: shared::MEDIA_TYPE_MODEL_DIRECTORY.to_string(),
                ..Default::default()
            });
        } else {
            blobs.push(Descriptor {
                name,
                media_type: shared::MEDIA_TYPE_MODEL_FILE.to_string(),
                ..Default::default()
            });
        }
    }
    shared::sort_descriptors(&mut blobs);

    Ok(LocalModel {
        config: config.ok_or_else(|| {
            ClientError::Other(format!("model config {config_file} not found in directory"))
        })?,
        blobs,
        annotations: Some(annotations),
    })
}

/// Scaffold a new model directory: a starter modelx.yaml plus a README
/// when none exists.
pub fn init_model(dir: &Path, force: bool) -> Result<()> {
    let config_path = dir.join(MODEL_CONFIG_FILE_NAME);
    if config_path.exists() && !force {
        return Err(ClientError::Other(format!(
            "path {} already exists",
            config_path.display()
        )));
    }
    std::fs::create_dir_all(dir)?;

    let config = ModelConfig {
        description: "This is a modelx model".to_string(),
        framework: "<some framework>".to_string(),
        task: "<some task>".to_string(),
        tags: vec!["modelx".to_string(), "<other>".to_string()],
        maintainers: vec!["maintainer".to_string()],
        model_files: Vec::new(),
        config: Some(serde_json::json!({"inputs": {}, "outputs": {}})),
        ..Default::default()
    };
    std::fs::write(&config_path, serde_yaml::to_string(&config)?)?;

    let readme_path = dir.join(README_FILE_NAME);
    if !readme_path.exists() {
        let base = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "model".to_string());
        std::fs::write(
            &readme_path,
            format!("# {base}\n\nAwesome model description.\n"),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path) {
        std::fs::write(
            dir.join(MODEL_CONFIG_FILE_NAME),
            "description: a test model\nframework: torch\ntask: nlp\n",
        )
        .unwrap();
    }

    #[test]
    fn test_scan_directory_classifies_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        std::fs::write(dir.path().join("weights.bin"), b"w").unwrap();
        std::fs::create_dir(dir.path().join("tokenizer")).unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::create_dir(dir.path().join(".modelx")).unwrap();

        let model = scan_directory(dir.path(), MODEL_CONFIG_FILE_NAME).unwrap();
        assert_eq!(model.config.name, "modelx.yaml");
        assert_eq!(model.config.media_type, shared::MEDIA_TYPE_MODEL_CONFIG);
        let names: Vec<_> = model.blobs.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["tokenizer", "weights.bin"]);
        assert_eq!(model.blobs[0].media_type, shared::MEDIA_TYPE_MODEL_DIRECTORY);
        assert_eq!(model.blobs[1].media_type, shared::MEDIA_TYPE_MODEL_FILE);
        let annotations = model.annotations.unwrap();
        assert_eq!(annotations[ANNOTATION_DESCRIPTION], "a test model");
    }

    #[test]
    fn test_scan_requires_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("weights.bin"), b"w").unwrap();
        assert!(scan_directory(dir.path(), MODEL_CONFIG_FILE_NAME).is_err());
    }

    #[test]
    fn test_init_then_scan() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("my-model");
        init_model(&target, false).unwrap();
        assert!(target.join(README_FILE_NAME).exists());

        let model = scan_directory(&target, MODEL_CONFIG_FILE_NAME).unwrap();
        assert_eq!(model.config.name, "modelx.yaml");

        // refuses to clobber without force
        assert!(init_model(&target, false).is_err());
        init_model(&target, true).unwrap();
    }
}
