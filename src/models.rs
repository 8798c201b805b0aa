//! Model library: the `*.gguf` files kept under `work_dir/models`.
//!
//! The console lists them with `/models` and loads one by its number.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::session::types::estimate_parameter_class;

pub const LIBRARY_DIR: &str = "models";

/// One model file found in the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// `None` where the filesystem does not record it.
    pub modified: Option<DateTime<Utc>>,
    pub parameter_class: String,
}

pub fn library_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(LIBRARY_DIR)
}

/// List the model files in `dir`, sorted by name.  Creates `dir` if missing.
pub fn scan(dir: &Path) -> Result<Vec<ModelFile>, AppError> {
    std::fs::create_dir_all(dir)?;

    let mut models = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let is_gguf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("gguf"));
        if !is_gguf {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "model library: stat failed");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        models.push(ModelFile {
            parameter_class: estimate_parameter_class(&name),
            name,
            path,
            size_bytes: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }

    models.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(dir = %dir.display(), count = models.len(), "model library scanned");
    Ok(models)
}

/// `1536` → `"1.5 KB"`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
