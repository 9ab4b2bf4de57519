//! Startup check that the one-time setup step has completed.
//!
//! The setup step installs the worker's runtime and downloads the model files
//! into `<model_dir>/<org>__<name>/`. The gateway does not run it; it only
//! refuses to start when its results are missing.

use std::path::Path;

use crate::config::WorkerConfig;
use crate::errors::ProvisioningError;

/// Files the setup step downloads, per model.
pub const MODEL_FILES: &[(&str, &[&str])] = &[
    (
        "Helsinki-NLP/opus-mt-mul-en",
        &[
            "config.json",
            "pytorch_model.bin",
            "tokenizer_config.json",
            "source.spm",
            "target.spm",
            "vocab.json",
        ],
    ),
    (
        "facebook/bart-large-cnn",
        &[
            "config.json",
            "model.safetensors",
            "generation_config.json",
            "vocab.json",
            "merges.txt",
            "tokenizer.json",
        ],
    ),
];

/// Directory name a model is stored under.
pub fn model_dir_name(model: &str) -> String {
    model.replace('/', "__")
}

pub fn missing_model_files(model_dir: &Path) -> Vec<String> {
    MODEL_FILES
        .iter()
        .flat_map(|(model, files)| {
            let dir = model_dir_name(model);
            files.iter().map(move |file| format!("{dir}/{file}"))
        })
        .filter(|relative| !model_dir.join(relative).is_file())
        .collect()
}

pub fn verify(model_dir: &Path, worker: &WorkerConfig) -> Result<(), ProvisioningError> {
    if let Some(script) = &worker.script {
        let script = match &worker.working_dir {
            Some(dir) if script.is_relative() => dir.join(script),
            _ => script.clone(),
        };
        if !script.is_file() {
            return Err(ProvisioningError::MissingWorkerScript(script));
        }
    }

    let missing = missing_model_files(model_dir);
    if !missing.is_empty() {
        return Err(ProvisioningError::MissingModelFiles {
            model_dir: model_dir.to_path_buf(),
            missing,
        });
    }
    tracing::info!(model_dir = %model_dir.display(), "provisioning check passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn populate(model_dir: &Path) {
        for (model, files) in MODEL_FILES {
            let dir = model_dir.join(model_dir_name(model));
            fs::create_dir_all(&dir).unwrap();
            for file in *files {
                fs::write(dir.join(file), b"x").unwrap();
            }
        }
    }

    fn worker_with_script(dir: &Path) -> WorkerConfig {
        WorkerConfig {
            program: "python3".to_string(),
            script: Some("Translate.py".into()),
            args: Vec::new(),
            working_dir: Some(dir.to_path_buf()),
        }
    }

    #[test]
    fn complete_setup_passes() {
        let models = tempfile::tempdir().unwrap();
        let scripts = tempfile::tempdir().unwrap();
        populate(models.path());
        fs::write(scripts.path().join("Translate.py"), b"print('{}')").unwrap();

        verify(models.path(), &worker_with_script(scripts.path())).unwrap();
    }

    #[test]
    fn missing_script_is_reported_first() {
        let models = tempfile::tempdir().unwrap();
        let scripts = tempfile::tempdir().unwrap();
        populate(models.path());

        let err = verify(models.path(), &worker_with_script(scripts.path())).unwrap_err();
        assert!(matches!(err, ProvisioningError::MissingWorkerScript(path) if path.ends_with("Translate.py")));
    }

    #[test]
    fn reports_every_missing_model_file() {
        let models = tempfile::tempdir().unwrap();
        populate(models.path());
        fs::remove_file(models.path().join("facebook__bart-large-cnn/merges.txt")).unwrap();
        fs::remove_file(models.path().join("Helsinki-NLP__opus-mt-mul-en/source.spm")).unwrap();

        let worker = WorkerConfig {
            script: None,
            ..WorkerConfig::default()
        };
        match verify(models.path(), &worker) {
            Err(ProvisioningError::MissingModelFiles { missing, .. }) => assert_eq!(
                missing,
                vec![
                    "Helsinki-NLP__opus-mt-mul-en/source.spm".to_string(),
                    "facebook__bart-large-cnn/merges.txt".to_string(),
                ]
            ),
            other => panic!("expected missing model files, got {other:?}"),
        }
    }

    #[test]
    fn empty_model_dir_lists_all_files() {
        let models = tempfile::tempdir().unwrap();
        let expected: usize = MODEL_FILES.iter().map(|(_, files)| files.len()).sum();
        assert_eq!(missing_model_files(models.path()).len(), expected);
    }
}
