use std::path::{Path, PathBuf};

/// Environment variable naming the appearance embedding model.
pub const EMBEDDER_ENV: &str = "FOCUS_LOCK_EMBEDDER";
/// Where the embedding model is looked for relative to each search root.
pub const DEFAULT_MODEL_PATH: &str = "models/appearance.onnx";

/// Resolve the appearance embedding model, if one is available.
///
/// Priority order:
/// 1) `explicit` (if the file exists)
/// 2) FOCUS_LOCK_EMBEDDER (if the file exists)
/// 3) models/appearance.onnx under the cwd or the executable's ancestors
///
/// `None` means the session will run in histogram mode.
pub fn locate_embedding_model(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(
            path = %path.display(),
            "embedding model path does not exist; attempting auto-discovery"
        );
    }

    if let Some(existing) = std::env::var_os(EMBEDDER_ENV) {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using {EMBEDDER_ENV} from environment");
            return Some(existing_path);
        }
        tracing::warn!(
            path = %existing_path.display(),
            "{EMBEDDER_ENV} is set but file does not exist; attempting auto-discovery"
        );
    }

    let found = model_candidates(&search_roots()).into_iter().find(|c| c.is_file());
    match &found {
        Some(path) => tracing::info!(path = %path.display(), "discovered embedding model"),
        None => tracing::debug!("no embedding model found; appearance matching will use histograms"),
    }
    found
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    roots
}

fn model_candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    roots.iter().map(|root| root.join(DEFAULT_MODEL_PATH)).collect()
}
