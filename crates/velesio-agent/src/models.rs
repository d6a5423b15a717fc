use std::path::{Component, Path, PathBuf};

use crate::error::SupervisorError;

/// Model identifiers are relative to the models directory and may not climb
/// out of it.
pub(crate) fn validate_model_id(model: &str) -> Result<(), SupervisorError> {
    if model.trim().is_empty() {
        return Err(SupervisorError::invalid("model", "must be non-empty"));
    }
    for c in Path::new(model).components() {
        match c {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(SupervisorError::invalid(
                    "model",
                    "path traversal is not allowed",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SupervisorError::invalid("model", "must be a relative name"));
            }
        }
    }
    Ok(())
}

/// Finds the artifact for `model` under `models_dir`.
///
/// Order: the exact path, then `model` with each of `extensions` appended,
/// then the lexicographically smallest directory entry whose name starts with
/// `model`.
pub async fn resolve_model(
    models_dir: &Path,
    model: &str,
    extensions: &[String],
) -> Result<PathBuf, SupervisorError> {
    validate_model_id(model)?;

    let exact = models_dir.join(model);
    if tokio::fs::try_exists(&exact).await.unwrap_or(false) {
        return Ok(exact);
    }

    for ext in extensions {
        let candidate = models_dir.join(format!("{model}{ext}"));
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Ok(candidate);
        }
    }

    let names = list_dir_names(models_dir).await.unwrap_or_default();
    if let Some(name) = names.into_iter().find(|n| n.starts_with(model)) {
        let found = models_dir.join(name);
        tracing::info!(model, path = %found.display(), "model resolved by prefix match");
        return Ok(found);
    }

    Err(SupervisorError::ModelNotFound {
        model: model.to_string(),
    })
}

/// Sorted file names in `dir`. Names that are not valid UTF-8 are skipped.
pub async fn list_dir_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut rd = tokio::fs::read_dir(dir).await?;
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        if let Ok(name) = entry.file_name().into_string() {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}
