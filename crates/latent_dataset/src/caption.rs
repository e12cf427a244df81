//! Caption files and the JSON sidecar.

use crate::types::{DatasetError, DatasetResult};
use data_contracts::CaptionSidecar;
use std::path::{Path, PathBuf};

/// Probed after the configured extension, in this order.
pub const CAPTION_EXTENSIONS: [&str; 3] = ["txt", "json", "caption"];

/// Collapse line breaks into comma separators and drop empty tags.
pub fn clean_caption(raw: &str) -> String {
    raw.replace("\r\n", ", ")
        .replace(['\n', '\r'], ", ")
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn caption_candidates(image_path: &Path, caption_ext: &str) -> Vec<PathBuf> {
    let preferred = caption_ext.trim_start_matches('.');
    std::iter::once(preferred)
        .chain(CAPTION_EXTENSIONS.iter().copied().filter(|ext| *ext != preferred))
        .map(|ext| image_path.with_extension(ext))
        .collect()
}

/// Read the caption next to `image_path`, falling back to `default` when none exists.
pub fn load_caption(image_path: &Path, caption_ext: &str, default: &str) -> DatasetResult<String> {
    let Some(path) = caption_candidates(image_path, caption_ext)
        .into_iter()
        .find(|p| p.is_file())
    else {
        return Ok(default.to_string());
    };
    let raw = std::fs::read_to_string(&path).map_err(|e| DatasetError::io(&path, e))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        let sidecar: CaptionSidecar = serde_json::from_str(&raw).map_err(|e| DatasetError::Json {
            path: path.clone(),
            source: e,
        })?;
        return Ok(sidecar
            .caption
            .map(|c| clean_caption(&c))
            .unwrap_or_else(|| default.to_string()));
    }
    Ok(clean_caption(&raw))
}

/// Parse and validate `<stem>.json`.
pub fn load_sidecar(image_path: &Path) -> DatasetResult<CaptionSidecar> {
    let path = image_path.with_extension("json");
    let raw = std::fs::read_to_string(&path).map_err(|e| DatasetError::io(&path, e))?;
    let sidecar: CaptionSidecar = serde_json::from_str(&raw).map_err(|e| DatasetError::Json {
        path: path.clone(),
        source: e,
    })?;
    sidecar
        .validate()
        .map_err(|e| DatasetError::Sidecar { path, source: e })?;
    Ok(sidecar)
}
