//! Model materialization.
//!
//! Copies a bundled model directory into the per-language directory under the
//! models root and registers the language. Once [`install_model`] returns,
//! the target directory holds everything the engine loader needs.

use std::fs;
use std::path::{Path, PathBuf};

use crate::registry::{LanguageProfile, LanguageRegistry};
use crate::TtsError;

/// Install the model files in `source` for `profile` and register it.
///
/// Files already present in the target directory are left untouched. Any
/// existing registry record for the same language is replaced, and the
/// language becomes current if no language is current yet.
///
/// Returns the per-language model directory.
pub fn install_model(
    source: &Path,
    models_root: &Path,
    profile: LanguageProfile,
    registry: &dyn LanguageRegistry,
) -> Result<PathBuf, TtsError> {
    if !source.is_dir() {
        return Err(TtsError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Model source {} is not a directory", source.display()),
        )));
    }

    let target = models_root.join(profile.model_dir_name());
    log::info!(
        "Installing model from {} to {}",
        source.display(),
        target.display()
    );
    let copied = copy_dir(source, &target)?;
    log::debug!("Copied {copied} new files for {}", profile.lang);

    if !target.join(&profile.model_file_name).exists() {
        log::warn!(
            "{} not found in {}; the loader will fall back to the first .onnx file",
            profile.model_file_name,
            target.display()
        );
    }

    let lang = profile.lang.clone();
    registry.add(profile)?;
    if registry.current().is_none() {
        registry.set_current(&lang)?;
    }

    Ok(target)
}

/// Recursively copy `src` into `dst`, skipping files that already exist.
///
/// Returns the number of files written.
fn copy_dir(src: &Path, dst: &Path) -> Result<usize, TtsError> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copied += copy_dir(&from, &to)?;
        } else if !to.exists() {
            fs::copy(&from, &to)?;
            copied += 1;
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{JsonRegistry, ModelType};

    fn bundled_model(root: &Path) -> PathBuf {
        let source = root.join("bundle/engUSA");
        fs::create_dir_all(source.join("espeak-ng-data/voices")).unwrap();
        fs::write(source.join("model.onnx"), b"onnx").unwrap();
        fs::write(source.join("model.onnx.json"), b"{}").unwrap();
        fs::write(source.join("espeak-ng-data/voices/en"), b"voice").unwrap();
        source
    }

    #[test]
    fn copies_tree_and_registers_as_current() {
        let dir = tempfile::tempdir().unwrap();
        let source = bundled_model(dir.path());
        let models = dir.path().join("models");
        let registry = JsonRegistry::in_memory();

        let profile = LanguageProfile::new("eng", "USA", "model.onnx", ModelType::VitsPiper);
        let target = install_model(&source, &models, profile, &registry).unwrap();

        assert_eq!(target, models.join("engUSA"));
        assert!(target.join("model.onnx").exists());
        assert!(target.join("espeak-ng-data/voices/en").exists());
        assert_eq!(registry.current().as_deref(), Some("eng"));
        assert_eq!(registry.list_installed().len(), 1);
    }

    #[test]
    fn existing_files_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let source = bundled_model(dir.path());
        let models = dir.path().join("models");
        fs::create_dir_all(models.join("engUSA")).unwrap();
        fs::write(models.join("engUSA/model.onnx"), b"newer").unwrap();

        let registry = JsonRegistry::in_memory();
        let profile = LanguageProfile::new("eng", "USA", "model.onnx", ModelType::VitsPiper);
        install_model(&source, &models, profile, &registry).unwrap();

        assert_eq!(fs::read(models.join("engUSA/model.onnx")).unwrap(), b"newer");
    }

    #[test]
    fn keeps_existing_current_language() {
        let dir = tempfile::tempdir().unwrap();
        let source = bundled_model(dir.path());
        let registry = JsonRegistry::in_memory();
        registry
            .add(LanguageProfile::new("deu", "DEU", "model.onnx", ModelType::VitsPiper))
            .unwrap();
        registry.set_current("deu").unwrap();

        let profile = LanguageProfile::new("eng", "USA", "model.onnx", ModelType::VitsPiper);
        install_model(&source, &dir.path().join("models"), profile, &registry).unwrap();

        assert_eq!(registry.current().as_deref(), Some("deu"));
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JsonRegistry::in_memory();
        let profile = LanguageProfile::new("eng", "USA", "model.onnx", ModelType::VitsPiper);
        let err = install_model(&dir.path().join("nope"), dir.path(), profile, &registry);
        assert!(matches!(err, Err(TtsError::Io(_))));
        assert!(registry.list_installed().is_empty());
    }
}
