//! Dataset configuration, loaded from TOML.

use crate::aug::AugmentationPipeline;
use crate::types::{DatasetError, DatasetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "LATENT_DATASET_CONFIG";
const DEFAULT_CONFIG_NAME: &str = "latent_dataset.toml";

/// One named augmentation with its raw parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentSpec {
    pub method: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl AugmentSpec {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub folder_path: PathBuf,
    /// Square-equivalent edge length of the target buckets.
    pub resolution: u32,
    /// Bucket dimensions are multiples of this.
    pub bucket_tolerance: u32,
    /// Pre-scale applied to natural sizes before bucketing.
    pub scale: f64,
    pub random_crop: bool,
    pub batch_size: usize,
    pub augmentations: Vec<AugmentSpec>,
    pub shuffle_augmentations: bool,
    pub control_path: Option<PathBuf>,
    /// Resize control images to 512x512 instead of the bucket crop.
    pub full_size_control_images: bool,
    pub mask_path: Option<PathBuf>,
    /// Use the primary image's alpha channel as its mask.
    pub alpha_mask: bool,
    pub invert_mask: bool,
    pub mask_min_value: f32,
    pub clip_image_path: Option<PathBuf>,
    pub clip_image_augmentations: Vec<AugmentSpec>,
    pub clip_image_shuffle_augmentations: bool,
    pub clip_image_size: Option<u32>,
    pub unconditional_path: Option<PathBuf>,
    pub cache_latents: bool,
    pub cache_latents_to_disk: bool,
    /// Name of the region in each sidecar's `poi` map.
    pub poi: Option<String>,
    pub caption_ext: String,
    pub default_caption: String,
    pub flip_x: bool,
    pub flip_y: bool,
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            folder_path: PathBuf::from("dataset"),
            resolution: 512,
            bucket_tolerance: 64,
            scale: 1.0,
            random_crop: false,
            batch_size: 1,
            augmentations: Vec::new(),
            shuffle_augmentations: false,
            control_path: None,
            full_size_control_images: false,
            mask_path: None,
            alpha_mask: false,
            invert_mask: false,
            mask_min_value: 0.0,
            clip_image_path: None,
            clip_image_augmentations: Vec::new(),
            clip_image_shuffle_augmentations: false,
            clip_image_size: None,
            unconditional_path: None,
            cache_latents: false,
            cache_latents_to_disk: false,
            poi: None,
            caption_ext: "txt".to_string(),
            default_caption: String::new(),
            flip_x: false,
            flip_y: false,
            seed: None,
        }
    }
}

/// Augmentation pipelines resolved from a config.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAugmentations {
    pub primary: Option<AugmentationPipeline>,
    pub clip: Option<AugmentationPipeline>,
}

impl DatasetConfig {
    /// Load from `$LATENT_DATASET_CONFIG`, else `latent_dataset.toml` in the working directory.
    pub fn load() -> DatasetResult<Self> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_NAME));
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> DatasetResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| DatasetError::io(path, e))?;
        let cfg: DatasetConfig = toml::from_str(&raw).map_err(|e| DatasetError::Toml {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(cfg)
    }

    pub fn caches_latents(&self) -> bool {
        self.cache_latents || self.cache_latents_to_disk
    }

    /// Check cross-field constraints and resolve every augmentation eagerly.
    pub fn validate(&self) -> DatasetResult<ResolvedAugmentations> {
        if self.resolution == 0 {
            return Err(DatasetError::Config("resolution must be positive".into()));
        }
        if self.bucket_tolerance == 0 {
            return Err(DatasetError::Config(
                "bucket_tolerance must be positive".into(),
            ));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(DatasetError::Config(format!(
                "scale must be a positive number, got {}",
                self.scale
            )));
        }
        if self.batch_size == 0 {
            return Err(DatasetError::Config("batch_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.mask_min_value) {
            return Err(DatasetError::Config(format!(
                "mask_min_value must be within [0, 1], got {}",
                self.mask_min_value
            )));
        }
        if self.alpha_mask && self.mask_path.is_some() {
            return Err(DatasetError::Config(
                "alpha_mask and mask_path are mutually exclusive".into(),
            ));
        }
        if self.poi.is_some() {
            if self.caches_latents() {
                return Err(DatasetError::Config(
                    "poi cropping cannot be combined with latent caching".into(),
                ));
            }
            if self.caption_ext != "json" {
                return Err(DatasetError::Config(format!(
                    "poi cropping needs caption_ext = \"json\", got {:?}",
                    self.caption_ext
                )));
            }
        }
        Ok(ResolvedAugmentations {
            primary: AugmentationPipeline::from_specs(
                &self.augmentations,
                self.shuffle_augmentations,
            )?,
            clip: AugmentationPipeline::from_specs(
                &self.clip_image_augmentations,
                self.clip_image_shuffle_augmentations,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: DatasetConfig = toml::from_str("folder_path = \"imgs\"\nresolution = 768\n").unwrap();
        assert_eq!(cfg.folder_path, PathBuf::from("imgs"));
        assert_eq!(cfg.resolution, 768);
        assert_eq!(cfg.bucket_tolerance, 64);
        assert_eq!(cfg.caption_ext, "txt");
        assert!(cfg.validate().unwrap().primary.is_none());
    }

    #[test]
    fn augmentations_parse_from_toml() {
        let raw = r#"
folder_path = "imgs"
[[augmentations]]
method = "Rotate"
params = { limit = 15, interpolation = "cv2.INTER_LINEAR", border_mode = "cv2.BORDER_REFLECT_101" }
[[augmentations]]
method = "ColorJitter"
"#;
        let cfg: DatasetConfig = toml::from_str(raw).unwrap();
        let resolved = cfg.validate().unwrap();
        let names = resolved.primary.unwrap().names();
        assert_eq!(names, vec!["Rotate", "ColorJitter"]);
    }

    #[test]
    fn poi_rejects_caching_and_text_captions() {
        let cfg = DatasetConfig {
            poi: Some("face".into()),
            caption_ext: "json".into(),
            cache_latents_to_disk: true,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(DatasetError::Config(_))));
        let cfg = DatasetConfig {
            poi: Some("face".into()),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(DatasetError::Config(_))));
    }

    #[test]
    fn unknown_augmentation_is_fatal() {
        let cfg = DatasetConfig {
            augmentations: vec![AugmentSpec::new("Solarize")],
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(DatasetError::UnknownAugmentation { .. })
        ));
    }
}
