use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Per-image JSON sidecar (`<stem>.json`) holding the caption and named regions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptionSidecar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub poi: BTreeMap<String, PoiRegion>,
}

/// A named rectangle in source-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoiRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Integer pixel rectangle (`x`, `y` is the top-left corner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Saturates at `u32::MAX` for regions reaching past the coordinate range.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &PixelRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Mirror horizontally inside an image of width `extent`.
    pub fn mirrored_x(&self, extent: u32) -> PixelRect {
        PixelRect {
            x: extent.saturating_sub(self.right()),
            ..*self
        }
    }

    /// Mirror vertically inside an image of height `extent`.
    pub fn mirrored_y(&self, extent: u32) -> PixelRect {
        PixelRect {
            y: extent.saturating_sub(self.bottom()),
            ..*self
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("region {name:?} has non-finite or negative values: {region:?}")]
    InvalidRegion { name: String, region: PoiRegion },
    #[error("region {name:?} has an empty extent: {region:?}")]
    EmptyRegion { name: String, region: PoiRegion },
    #[error("latent metadata missing key {0:?}")]
    MissingKey(&'static str),
    #[error("latent metadata key {key:?} has invalid value {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("latent metadata filename is empty")]
    EmptyFilename,
}

impl PoiRegion {
    /// Truncate to whole pixels, matching how sidecar coordinates are consumed.
    pub fn to_pixels(&self) -> PixelRect {
        PixelRect {
            x: self.x as u32,
            y: self.y as u32,
            width: self.width as u32,
            height: self.height as u32,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ValidationError> {
        let values = [self.x, self.y, self.width, self.height];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ValidationError::InvalidRegion {
                name: name.to_string(),
                region: *self,
            });
        }
        if self.width < 1.0 || self.height < 1.0 {
            return Err(ValidationError::EmptyRegion {
                name: name.to_string(),
                region: *self,
            });
        }
        Ok(())
    }
}

impl CaptionSidecar {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, region) in &self.poi {
            region.validate(name)?;
        }
        Ok(())
    }

    pub fn region(&self, name: &str) -> Option<&PoiRegion> {
        self.poi.get(name)
    }
}
