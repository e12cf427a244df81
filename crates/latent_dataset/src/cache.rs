//! Content-addressed latent cache.
//!
//! Each entry lives at `<image_dir>/_latent_cache/<stem>_<digest>.safetensors`,
//! where the digest is SHA-256 over the item's [`LatentInfo`] with sorted keys,
//! encoded as URL-safe base64 without padding. The file holds a single `F32`
//! tensor named `latent` and carries the record as its `__metadata__`.

use crate::item::{file_stem, FileItem};
use crate::tensor::LatentTensor;
use crate::types::{DatasetError, DatasetResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use burn::tensor::{backend::Backend, DType, Tensor};
use data_contracts::LatentInfo;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LATENT_CACHE_DIR: &str = "_latent_cache";
pub const LATENT_TENSOR_NAME: &str = "latent";
pub const CACHE_FILE_EXTENSION: &str = "safetensors";
pub const DEFAULT_LATENT_VERSION: u32 = 1;
/// Latent space assumed until an encoder reports its own.
pub const DEFAULT_LATENT_SPACE_VERSION: &str = "sd1";

const METADATA_KEY: &str = "__metadata__";

/// External image encoder used by the cache population pass.
pub trait LatentEncoder<B: Backend> {
    /// `pixels` is `[N, 3, H, W]` in `[-1, 1]`.
    fn encode(
        &self,
        pixels: Tensor<B, 4>,
        device: &B::Device,
        dtype: DType,
    ) -> DatasetResult<Tensor<B, 4>>;

    fn decode(&self, latents: Tensor<B, 4>) -> DatasetResult<Tensor<B, 4>>;

    /// Identifies the latent space, e.g. `sd1` or `sdxl`. Part of every cache key.
    fn latent_space_version(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    pub to_disk: bool,
    pub to_memory: bool,
}

impl CachePolicy {
    pub fn enabled(&self) -> bool {
        self.to_disk || self.to_memory
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePassReport {
    pub total: usize,
    /// Already present on disk before the pass.
    pub hits: usize,
    pub encoded: usize,
    pub written: usize,
    /// Items whose image could not be loaded; they stay uncached.
    pub failed: usize,
}

pub fn latent_hash(info: &LatentInfo) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(info.canonical_json()))
}

/// Cache path for `image_path` under the given geometry record.
pub fn latent_path_for(image_path: &Path, info: &LatentInfo) -> DatasetResult<PathBuf> {
    let stem = file_stem(image_path)?;
    let dir = image_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(LATENT_CACHE_DIR);
    Ok(dir.join(format!(
        "{stem}_{}.{CACHE_FILE_EXTENSION}",
        latent_hash(info)
    )))
}

fn format_err(path: &Path, msg: impl Into<String>) -> DatasetError {
    DatasetError::CacheFormat {
        path: path.to_path_buf(),
        msg: msg.into(),
    }
}

/// Write a single-tensor safetensors file. The write goes through a temporary
/// sibling and a rename, so readers never see a partial file.
pub fn write_latent(path: &Path, latent: &LatentTensor, info: &LatentInfo) -> DatasetResult<()> {
    let data_len = latent.data.len() * std::mem::size_of::<f32>();
    let mut header = Map::new();
    header.insert(
        METADATA_KEY.to_string(),
        Value::Object(
            info.to_metadata()
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        ),
    );
    header.insert(
        LATENT_TENSOR_NAME.to_string(),
        json!({
            "dtype": "F32",
            "shape": latent.shape,
            "data_offsets": [0, data_len],
        }),
    );
    let mut header_bytes = serde_json::to_vec(&Value::Object(header)).map_err(|e| DatasetError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    // data must start on an 8-byte boundary
    while header_bytes.len() % 8 != 0 {
        header_bytes.push(b' ');
    }

    let mut buf = Vec::with_capacity(8 + header_bytes.len() + data_len);
    buf.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(&header_bytes);
    for v in &latent.data {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    let dir = path
        .parent()
        .ok_or_else(|| format_err(path, "cache path has no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| DatasetError::io(dir, e))?;
    let tmp = path.with_extension(format!("{CACHE_FILE_EXTENSION}.{}.tmp", std::process::id()));
    fs::write(&tmp, &buf).map_err(|e| DatasetError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| DatasetError::io(path, e))?;
    Ok(())
}

#[derive(Deserialize)]
struct TensorEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Read the `latent` tensor and, when present and well-formed, its geometry record.
pub fn read_latent(path: &Path) -> DatasetResult<(LatentTensor, Option<LatentInfo>)> {
    let bytes = fs::read(path).map_err(|e| DatasetError::io(path, e))?;
    if bytes.len() < 8 {
        return Err(format_err(path, "file shorter than its header length"));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[..8]);
    let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| format_err(path, "header length overflows"))?;
    let data_start = 8usize
        .checked_add(header_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| format_err(path, "header runs past end of file"))?;
    let header: Map<String, Value> =
        serde_json::from_slice(&bytes[8..data_start]).map_err(|e| DatasetError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;

    let entry = header
        .get(LATENT_TENSOR_NAME)
        .cloned()
        .ok_or_else(|| format_err(path, "no tensor named `latent`"))?;
    let entry: TensorEntry = serde_json::from_value(entry).map_err(|e| DatasetError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    if entry.dtype != "F32" {
        return Err(format_err(path, format!("unsupported dtype {}", entry.dtype)));
    }
    let [begin, end] = entry.data_offsets;
    let data = &bytes[data_start..];
    if begin > end || end > data.len() {
        return Err(format_err(path, format!("data offsets [{begin}, {end}] out of range")));
    }
    let floats: Vec<f32> = data[begin..end]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let tensor = LatentTensor::new(entry.shape, floats).map_err(|e| format_err(path, e.to_string()))?;

    let info = header
        .get(METADATA_KEY)
        .and_then(|m| serde_json::from_value::<BTreeMap<String, String>>(m.clone()).ok())
        .and_then(|meta| match LatentInfo::from_metadata(&meta) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed cache metadata");
                None
            }
        });
    Ok((tensor, info))
}

impl FileItem {
    /// The record that addresses this item's latent under its current geometry.
    pub fn latent_info(&self) -> LatentInfo {
        let g = &self.geometry;
        LatentInfo {
            filename: self.file_name(),
            scale_to_width: g.scale_to_width,
            scale_to_height: g.scale_to_height,
            crop_x: g.crop_x,
            crop_y: g.crop_y,
            crop_width: g.crop_width,
            crop_height: g.crop_height,
            latent_space_version: self.latent.space_version.clone(),
            latent_version: self.latent.version,
            flip_x: self.flip_x,
            flip_y: self.flip_y,
        }
    }

    /// Recompute the cache path from current geometry and remember it.
    pub fn refresh_latent_path(&mut self) -> DatasetResult<PathBuf> {
        let path = latent_path_for(&self.path, &self.latent_info())?;
        self.latent.path = Some(path.clone());
        Ok(path)
    }

    /// Resident latent if held, otherwise read from the path derived from current geometry.
    pub fn get_latent(&mut self) -> DatasetResult<LatentTensor> {
        if let Some(latent) = &self.latent.resident {
            return Ok(latent.clone());
        }
        let path = self.refresh_latent_path()?;
        let (latent, _) = read_latent(&path)?;
        self.latent.resident = Some(latent.clone());
        Ok(latent)
    }
}

/// Cache files under the items' cache directories that no item addresses.
///
/// Refuses to run while any item has no latent space version, since every
/// live file would then look orphaned.
pub fn orphaned_files(items: &[FileItem]) -> DatasetResult<Vec<PathBuf>> {
    if let Some(item) = items.iter().find(|i| i.latent.space_version.trim().is_empty()) {
        return Err(DatasetError::Config(format!(
            "{} has no latent space version; cannot tell live cache files from orphans",
            item.path.display()
        )));
    }
    let mut live = HashSet::new();
    let mut dirs = Vec::new();
    for item in items {
        let path = latent_path_for(&item.path, &item.latent_info())?;
        if let Some(dir) = path.parent() {
            if !dirs.iter().any(|d: &PathBuf| d == dir) {
                dirs.push(dir.to_path_buf());
            }
        }
        live.insert(path);
    }

    let mut orphans = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir).map_err(|e| DatasetError::io(&dir, e))? {
            let path = entry.map_err(|e| DatasetError::io(&dir, e))?.path();
            let is_cache_file = path
                .extension()
                .is_some_and(|ext| ext == CACHE_FILE_EXTENSION);
            if is_cache_file && !live.contains(&path) {
                orphans.push(path);
            }
        }
    }
    orphans.sort();
    Ok(orphans)
}

/// Delete [`orphaned_files`]. Returns what was removed.
pub fn prune_orphans(items: &[FileItem]) -> DatasetResult<Vec<PathBuf>> {
    let orphans = orphaned_files(items)?;
    for path in &orphans {
        fs::remove_file(path).map_err(|e| DatasetError::io(path, e))?;
        debug!(path = %path.display(), "removed orphaned latent");
    }
    if !orphans.is_empty() {
        info!(count = orphans.len(), "pruned orphaned latent cache files");
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat() -> LatentInfo {
        LatentInfo {
            filename: "cat.png".into(),
            scale_to_width: 520,
            scale_to_height: 520,
            crop_x: 4,
            crop_y: 4,
            crop_width: 512,
            crop_height: 512,
            latent_space_version: "sd1".into(),
            latent_version: 1,
            flip_x: false,
            flip_y: false,
        }
    }

    #[test]
    fn hash_is_urlsafe_and_unpadded() {
        let h = latent_hash(&cat());
        assert_eq!(h.len(), 43);
        assert!(h.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn every_field_changes_the_digest() {
        let base = latent_hash(&cat());
        let variants: Vec<(&str, fn(&mut LatentInfo))> = vec![
            ("filename", |i| i.filename = "dog.png".into()),
            ("scale_to_width", |i| i.scale_to_width += 1),
            ("scale_to_height", |i| i.scale_to_height += 1),
            ("crop_x", |i| i.crop_x += 1),
            ("crop_y", |i| i.crop_y += 1),
            ("crop_width", |i| i.crop_width -= 8),
            ("crop_height", |i| i.crop_height -= 8),
            ("latent_space_version", |i| i.latent_space_version = "sdxl".into()),
            ("latent_version", |i| i.latent_version += 1),
            ("flip_x", |i| i.flip_x = true),
            ("flip_y", |i| i.flip_y = true),
        ];
        let mut seen = HashSet::new();
        seen.insert(base.clone());
        for (field, change) in variants {
            let mut info = cat();
            change(&mut info);
            let digest = latent_hash(&info);
            assert_ne!(digest, base, "{field}");
            assert!(seen.insert(digest), "{field} collides with another variant");
        }
        assert_eq!(latent_hash(&cat()), base);
    }

    #[test]
    fn path_layout() {
        let path = latent_path_for(Path::new("/data/imgs/cat.png"), &cat()).unwrap();
        let expected_name = format!("cat_{}.safetensors", latent_hash(&cat()));
        assert_eq!(path, Path::new("/data/imgs/_latent_cache").join(expected_name));
    }

    #[test]
    fn safetensors_layout_is_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.safetensors");
        let latent = LatentTensor::new(vec![4, 2, 2], (0..16).map(|v| v as f32 * 0.5).collect()).unwrap();
        write_latent(&path, &latent, &cat()).unwrap();

        let bytes = fs::read(&path).unwrap();
        let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        assert_eq!(header_len % 8, 0);
        assert_eq!(bytes.len(), 8 + header_len + 16 * 4);
        let header: Value = serde_json::from_slice(&bytes[8..8 + header_len]).unwrap();
        assert_eq!(header["latent"]["dtype"], "F32");
        assert_eq!(header["__metadata__"]["filename"], "cat.png");

        let (back, info) = read_latent(&path).unwrap();
        assert_eq!(back, latent);
        assert_eq!(info, Some(cat()));
    }

    #[test]
    fn truncated_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        fs::write(&path, [200u8, 0, 0, 0, 0, 0, 0, 0, b'{']).unwrap();
        assert!(matches!(read_latent(&path), Err(DatasetError::CacheFormat { .. })));
    }
}
