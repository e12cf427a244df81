//! Per-image records: geometry, companions and cache state.

use crate::aug::{ComposedPipeline, ReplayRecord};
use crate::cache::{DEFAULT_LATENT_SPACE_VERSION, DEFAULT_LATENT_VERSION};
use crate::caption;
use crate::config::{DatasetConfig, ResolvedAugmentations};
use crate::processing::{oriented_dimensions, IMAGE_EXTENSIONS};
use crate::tensor::{ImageTensor, LatentTensor};
use crate::types::{DatasetError, DatasetResult};
use data_contracts::PixelRect;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Scale and crop applied to an image before it enters a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub scale_to_width: u32,
    pub scale_to_height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_width: u32,
    pub crop_height: u32,
}

impl Geometry {
    /// The crop window lies inside the scaled image.
    pub fn is_consistent(&self) -> bool {
        self.crop_x as u64 + self.crop_width as u64 <= self.scale_to_width as u64
            && self.crop_y as u64 + self.crop_height as u64 <= self.scale_to_height as u64
    }

    pub fn crop_rect(&self) -> PixelRect {
        PixelRect::new(self.crop_x, self.crop_y, self.crop_width, self.crop_height)
    }
}

/// A paired image found next to the primary by file stem.
#[derive(Debug, Clone)]
pub struct Companion {
    pub path: PathBuf,
    pub tensor: Option<ImageTensor>,
}

impl Companion {
    pub fn new(path: PathBuf) -> Self {
        Self { path, tensor: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskSource {
    File(PathBuf),
    /// Alpha channel of the primary image.
    Alpha,
}

#[derive(Debug, Clone)]
pub struct MaskCompanion {
    pub source: MaskSource,
    pub tensor: Option<ImageTensor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoiState {
    pub name: String,
    /// Region in natural, unflipped image pixels.
    pub region: PixelRect,
    /// Region in crop coordinates after a successful placement.
    pub in_crop: Option<PixelRect>,
}

#[derive(Debug, Clone, Default)]
pub struct LatentState {
    pub is_cached: bool,
    pub path: Option<PathBuf>,
    /// Only populated when latents stay in memory.
    pub resident: Option<LatentTensor>,
    pub space_version: String,
    pub version: u32,
    pub to_disk: bool,
    pub to_memory: bool,
}

#[derive(Debug, Clone)]
pub struct FileItem {
    pub path: PathBuf,
    /// Natural size with EXIF orientation applied.
    pub width: u32,
    pub height: u32,
    pub config: Arc<DatasetConfig>,
    pub geometry: Geometry,
    pub flip_x: bool,
    pub flip_y: bool,
    pub caption: String,
    pub poi: Option<PoiState>,
    pub control: Option<Companion>,
    pub mask: Option<MaskCompanion>,
    pub clip: Option<Companion>,
    pub unconditional: Option<Companion>,
    pub augment: Option<ComposedPipeline>,
    pub clip_augment: Option<ComposedPipeline>,
    pub replay: Option<ReplayRecord>,
    pub tensor: Option<ImageTensor>,
    pub unaugmented_tensor: Option<ImageTensor>,
    pub latent: LatentState,
}

impl FileItem {
    pub fn new(
        path: PathBuf,
        config: Arc<DatasetConfig>,
        pipelines: &ResolvedAugmentations,
        flip_x: bool,
        flip_y: bool,
        rng: &mut dyn RngCore,
    ) -> DatasetResult<Self> {
        let (width, height) = oriented_dimensions(&path)?;
        let stem = file_stem(&path)?;
        let caption = caption::load_caption(&path, &config.caption_ext, &config.default_caption)?;
        let poi = match &config.poi {
            Some(name) => Some(load_poi(&path, name, width, height)?),
            None => None,
        };

        let control = companion(config.control_path.as_deref(), &stem, "control");
        let clip = companion(config.clip_image_path.as_deref(), &stem, "clip");
        let unconditional = companion(config.unconditional_path.as_deref(), &stem, "unconditional");
        let mask = if config.alpha_mask {
            Some(MaskCompanion {
                source: MaskSource::Alpha,
                tensor: None,
            })
        } else {
            companion(config.mask_path.as_deref(), &stem, "mask").map(|c| MaskCompanion {
                source: MaskSource::File(c.path),
                tensor: None,
            })
        };

        let augment = pipelines.primary.as_ref().map(|p| p.compose(rng));
        let clip_augment = if clip.is_some() {
            pipelines.clip.as_ref().map(|p| p.compose(rng))
        } else {
            None
        };
        let latent = LatentState {
            space_version: DEFAULT_LATENT_SPACE_VERSION.to_string(),
            version: DEFAULT_LATENT_VERSION,
            to_disk: config.cache_latents_to_disk,
            to_memory: config.cache_latents,
            ..Default::default()
        };

        Ok(Self {
            path,
            width,
            height,
            config,
            geometry: Geometry::default(),
            flip_x,
            flip_y,
            caption,
            poi,
            control,
            mask,
            clip,
            unconditional,
            augment,
            clip_augment,
            replay: None,
            tensor: None,
            unaugmented_tensor: None,
            latent,
        })
    }

    pub fn has_control(&self) -> bool {
        self.control.is_some()
    }

    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    pub fn has_clip(&self) -> bool {
        self.clip.is_some()
    }

    pub fn has_unconditional(&self) -> bool {
        self.unconditional.is_some()
    }

    pub fn has_poi(&self) -> bool {
        self.poi.is_some()
    }

    pub fn has_augmentations(&self) -> bool {
        self.augment.is_some()
    }

    /// File name including extension.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The point of interest mirrored to match this item's flips.
    pub fn oriented_poi(&self) -> Option<PixelRect> {
        let poi = self.poi.as_ref()?;
        let mut region = poi.region;
        if self.flip_x {
            region = region.mirrored_x(self.width);
        }
        if self.flip_y {
            region = region.mirrored_y(self.height);
        }
        Some(region)
    }

    /// Drop transient tensors. Memory-resident latents survive.
    pub fn cleanup(&mut self) {
        self.tensor = None;
        self.unaugmented_tensor = None;
        self.replay = None;
        for companion in [&mut self.control, &mut self.clip, &mut self.unconditional]
            .into_iter()
            .flatten()
        {
            companion.tensor = None;
        }
        if let Some(mask) = self.mask.as_mut() {
            mask.tensor = None;
        }
        if !self.latent.to_memory {
            self.latent.resident = None;
        }
    }
}

pub(crate) fn file_stem(path: &Path) -> DatasetResult<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| DatasetError::Other(format!("{} has no file name", path.display())))
}

/// First `<dir>/<stem>.<ext>` that exists, probing extensions in order.
pub fn find_companion(dir: &Path, stem: &str) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|p| p.is_file())
}

fn companion(dir: Option<&Path>, stem: &str, kind: &str) -> Option<Companion> {
    let dir = dir?;
    match find_companion(dir, stem) {
        Some(path) => Some(Companion::new(path)),
        None => {
            warn!(stem, kind, dir = %dir.display(), "companion image not found");
            None
        }
    }
}

fn load_poi(path: &Path, name: &str, width: u32, height: u32) -> DatasetResult<PoiState> {
    let sidecar = caption::load_sidecar(path)?;
    let region = match sidecar.region(name) {
        Some(region) => region.to_pixels(),
        None => {
            warn!(path = %path.display(), poi = name, "point of interest missing from sidecar; using the full image");
            PixelRect::new(0, 0, width, height)
        }
    };
    let bounds = PixelRect::new(0, 0, width, height);
    let region = if bounds.contains(&region) {
        region
    } else {
        warn!(path = %path.display(), poi = name, ?region, "point of interest exceeds the image; clamping");
        clamp_rect(region, width, height)
    };
    Ok(PoiState {
        name: name.to_string(),
        region,
        in_crop: None,
    })
}

fn clamp_rect(rect: PixelRect, width: u32, height: u32) -> PixelRect {
    let x = rect.x.min(width.saturating_sub(1));
    let y = rect.y.min(height.saturating_sub(1));
    PixelRect::new(
        x,
        y,
        rect.width.min(width - x).max(1),
        rect.height.min(height - y).max(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_consistency() {
        let ok = Geometry {
            scale_to_width: 600,
            scale_to_height: 512,
            crop_x: 50,
            crop_y: 0,
            crop_width: 512,
            crop_height: 512,
        };
        assert!(ok.is_consistent());
        let bad = Geometry { crop_x: 90, ..ok };
        assert!(!bad.is_consistent());
    }

    #[test]
    fn companion_probe_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"x").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        assert_eq!(find_companion(dir.path(), "a"), Some(dir.path().join("a.jpg")));
        assert_eq!(find_companion(dir.path(), "b"), None);
    }

    #[test]
    fn out_of_range_sidecar_region_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"poi": {"face": {"x": 4000000000, "y": 10, "width": 1000000000, "height": 20}}}"#,
        )
        .unwrap();
        let poi = load_poi(&image, "face", 1000, 800).unwrap();
        assert!(PixelRect::new(0, 0, 1000, 800).contains(&poi.region));
        assert_eq!(poi.region, PixelRect::new(999, 10, 1, 20));
    }

    #[test]
    fn clamp_keeps_region_inside() {
        let r = clamp_rect(PixelRect::new(90, 10, 40, 200), 100, 100);
        assert_eq!(r, PixelRect::new(90, 10, 10, 90));
    }
}
