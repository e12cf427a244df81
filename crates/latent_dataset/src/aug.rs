//! Augmentation pipelines whose spatial steps can be replayed onto paired images.
//!
//! Operations are resolved eagerly from an ordered list of `(method, params)`
//! specs. Applying a composed pipeline returns an [`AugmentationTrace`] holding
//! every executed step with its realized parameters; the spatial subset becomes a
//! [`ReplayRecord`] that companions replay without drawing new randomness.

use crate::config::AugmentSpec;
use crate::types::{DatasetError, DatasetResult};
use crate::warp;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    Nearest,
    Linear,
    Cubic,
    Area,
    Lanczos,
}

impl Interpolation {
    const NAMES: [(&'static str, i64, Interpolation); 5] = [
        ("cv2.INTER_NEAREST", 0, Interpolation::Nearest),
        ("cv2.INTER_LINEAR", 1, Interpolation::Linear),
        ("cv2.INTER_CUBIC", 2, Interpolation::Cubic),
        ("cv2.INTER_AREA", 3, Interpolation::Area),
        ("cv2.INTER_LANCZOS4", 4, Interpolation::Lanczos),
    ];

    pub fn from_value(value: &Value) -> Option<Self> {
        lookup(&Self::NAMES, value)
    }

    pub fn filter(self) -> FilterType {
        match self {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Linear | Interpolation::Area => FilterType::Triangle,
            Interpolation::Cubic => FilterType::CatmullRom,
            Interpolation::Lanczos => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BorderMode {
    Constant,
    Replicate,
    Reflect,
    Wrap,
    Reflect101,
}

impl BorderMode {
    const NAMES: [(&'static str, i64, BorderMode); 5] = [
        ("cv2.BORDER_CONSTANT", 0, BorderMode::Constant),
        ("cv2.BORDER_REPLICATE", 1, BorderMode::Replicate),
        ("cv2.BORDER_REFLECT", 2, BorderMode::Reflect),
        ("cv2.BORDER_WRAP", 3, BorderMode::Wrap),
        ("cv2.BORDER_REFLECT_101", 4, BorderMode::Reflect101),
    ];

    pub fn from_value(value: &Value) -> Option<Self> {
        lookup(&Self::NAMES, value)
    }
}

/// Enum parameters accept either the symbolic name or its integer value.
fn lookup<T: Copy>(table: &[(&str, i64, T)], value: &Value) -> Option<T> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            table
                .iter()
                .find(|(name, _, _)| *name == s || name.strip_prefix("cv2.") == Some(s))
                .map(|(_, _, v)| *v)
        }
        Value::Number(n) => {
            let n = n.as_i64()?;
            table.iter().find(|(_, id, _)| *id == n).map(|(_, _, v)| *v)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlipAxis {
    Horizontal,
    Vertical,
    Both,
}

/// A resolved operation with its parameter ranges.
#[derive(Debug, Clone, PartialEq)]
pub enum AugmentOp {
    Rotate {
        limit: (f32, f32),
        interpolation: Interpolation,
        border: BorderMode,
        p: f32,
    },
    HorizontalFlip {
        p: f32,
    },
    VerticalFlip {
        p: f32,
    },
    Flip {
        p: f32,
    },
    Resize {
        width: u32,
        height: u32,
        interpolation: Interpolation,
        p: f32,
    },
    Crop {
        x_min: u32,
        y_min: u32,
        x_max: u32,
        y_max: u32,
        p: f32,
    },
    RandomCrop {
        width: u32,
        height: u32,
        p: f32,
    },
    ElasticTransform {
        alpha: f32,
        sigma: f32,
        interpolation: Interpolation,
        border: BorderMode,
        p: f32,
    },
    GridDistortion {
        num_steps: u32,
        distort_limit: (f32, f32),
        interpolation: Interpolation,
        border: BorderMode,
        p: f32,
    },
    OpticalDistortion {
        distort_limit: (f32, f32),
        shift_limit: (f32, f32),
        interpolation: Interpolation,
        border: BorderMode,
        p: f32,
    },
    ColorJitter {
        brightness: (f32, f32),
        contrast: (f32, f32),
        saturation: (f32, f32),
        hue: (f32, f32),
        p: f32,
    },
    RandomBrightnessContrast {
        brightness_limit: (f32, f32),
        contrast_limit: (f32, f32),
        p: f32,
    },
    GaussNoise {
        var_limit: (f32, f32),
        p: f32,
    },
    GaussianBlur {
        sigma_limit: (f32, f32),
        p: f32,
    },
    ToGray {
        p: f32,
    },
}

/// How a scalar range parameter expands to `(lo, hi)`.
#[derive(Clone, Copy)]
enum Span {
    Symmetric,
    FromZero,
    AroundOne,
}

struct Params<'a> {
    op: &'static str,
    raw: &'a BTreeMap<String, Value>,
}

impl<'a> Params<'a> {
    fn err(&self, param: &str, msg: impl Into<String>) -> DatasetError {
        DatasetError::AugmentationParam {
            op: self.op.to_string(),
            param: param.to_string(),
            msg: msg.into(),
        }
    }

    fn check_keys(&self, allowed: &[&str]) -> DatasetResult<()> {
        for key in self.raw.keys() {
            let common = matches!(key.as_str(), "p" | "always_apply");
            if !common && !allowed.contains(&key.as_str()) {
                return Err(self.err(key, "not accepted by this operation"));
            }
        }
        Ok(())
    }

    fn number(&self, key: &str, value: &Value) -> DatasetResult<f32> {
        value
            .as_f64()
            .map(|v| v as f32)
            .filter(|v| v.is_finite())
            .ok_or_else(|| self.err(key, format!("expected a number, got {value}")))
    }

    fn f32_or(&self, key: &str, default: f32) -> DatasetResult<f32> {
        match self.raw.get(key) {
            Some(v) => self.number(key, v),
            None => Ok(default),
        }
    }

    fn u32_req(&self, key: &str) -> DatasetResult<u32> {
        let value = self
            .raw
            .get(key)
            .ok_or_else(|| self.err(key, "required"))?;
        value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| self.err(key, format!("expected a non-negative integer, got {value}")))
    }

    fn u32_or(&self, key: &str, default: u32) -> DatasetResult<u32> {
        if self.raw.contains_key(key) {
            self.u32_req(key)
        } else {
            Ok(default)
        }
    }

    fn range_or(&self, key: &str, default: f32, span: Span) -> DatasetResult<(f32, f32)> {
        let range = match self.raw.get(key) {
            None => expand(default, span),
            Some(Value::Array(items)) if items.len() == 2 => {
                (self.number(key, &items[0])?, self.number(key, &items[1])?)
            }
            Some(v @ Value::Number(_)) => expand(self.number(key, v)?, span),
            Some(v) => return Err(self.err(key, format!("expected a number or [lo, hi], got {v}"))),
        };
        if range.0 > range.1 {
            return Err(self.err(key, format!("range {:?} is inverted", range)));
        }
        Ok(range)
    }

    fn probability(&self) -> DatasetResult<f32> {
        if self.raw.get("always_apply").and_then(Value::as_bool) == Some(true) {
            return Ok(1.0);
        }
        let default = match self.op {
            "Resize" | "Crop" | "RandomCrop" => 1.0,
            _ => 0.5,
        };
        let p = self.f32_or("p", default)?;
        if !(0.0..=1.0).contains(&p) {
            return Err(self.err("p", format!("probability {p} outside [0, 1]")));
        }
        Ok(p)
    }

    fn interpolation(&self) -> DatasetResult<Interpolation> {
        match self.raw.get("interpolation") {
            None => Ok(Interpolation::Linear),
            Some(v) => Interpolation::from_value(v)
                .ok_or_else(|| self.err("interpolation", format!("unknown interpolation {v}"))),
        }
    }

    fn border(&self) -> DatasetResult<BorderMode> {
        match self.raw.get("border_mode") {
            None => Ok(BorderMode::Reflect101),
            Some(v) => BorderMode::from_value(v)
                .ok_or_else(|| self.err("border_mode", format!("unknown border mode {v}"))),
        }
    }
}

fn expand(v: f32, span: Span) -> (f32, f32) {
    let v = v.abs();
    match span {
        Span::Symmetric => (-v, v),
        Span::FromZero => (0.0, v),
        Span::AroundOne => ((1.0 - v).max(0.0), 1.0 + v),
    }
}

fn uniform(rng: &mut dyn RngCore, (lo, hi): (f32, f32)) -> f32 {
    if lo >= hi {
        lo
    } else {
        rng.random_range(lo..=hi)
    }
}

fn grid_steps(rng: &mut dyn RngCore, num_steps: u32, limit: (f32, f32)) -> Vec<f32> {
    (0..=num_steps).map(|_| 1.0 + uniform(rng, limit)).collect()
}

impl AugmentOp {
    /// Resolve a spec against the fixed vocabulary.
    pub fn from_spec(spec: &AugmentSpec) -> DatasetResult<Self> {
        const VOCABULARY: [&str; 15] = [
            "Rotate",
            "HorizontalFlip",
            "VerticalFlip",
            "Flip",
            "Resize",
            "Crop",
            "RandomCrop",
            "ElasticTransform",
            "GridDistortion",
            "OpticalDistortion",
            "ColorJitter",
            "RandomBrightnessContrast",
            "GaussNoise",
            "GaussianBlur",
            "ToGray",
        ];
        let op = VOCABULARY
            .iter()
            .copied()
            .find(|name| *name == spec.method.trim())
            .ok_or_else(|| DatasetError::UnknownAugmentation {
                name: spec.method.clone(),
            })?;
        let params = Params {
            op,
            raw: &spec.params,
        };
        let p = params.probability()?;
        let resolved = match op {
            "Rotate" => {
                params.check_keys(&["limit", "interpolation", "border_mode"])?;
                AugmentOp::Rotate {
                    limit: params.range_or("limit", 90.0, Span::Symmetric)?,
                    interpolation: params.interpolation()?,
                    border: params.border()?,
                    p,
                }
            }
            "HorizontalFlip" => {
                params.check_keys(&[])?;
                AugmentOp::HorizontalFlip { p }
            }
            "VerticalFlip" => {
                params.check_keys(&[])?;
                AugmentOp::VerticalFlip { p }
            }
            "Flip" => {
                params.check_keys(&[])?;
                AugmentOp::Flip { p }
            }
            "Resize" => {
                params.check_keys(&["width", "height", "interpolation"])?;
                let width = params.u32_req("width")?;
                let height = params.u32_req("height")?;
                if width == 0 || height == 0 {
                    return Err(params.err("width", "resize target must be non-empty"));
                }
                AugmentOp::Resize {
                    width,
                    height,
                    interpolation: params.interpolation()?,
                    p,
                }
            }
            "Crop" => {
                params.check_keys(&["x_min", "y_min", "x_max", "y_max"])?;
                let x_min = params.u32_or("x_min", 0)?;
                let y_min = params.u32_or("y_min", 0)?;
                let x_max = params.u32_req("x_max")?;
                let y_max = params.u32_req("y_max")?;
                if x_max <= x_min || y_max <= y_min {
                    return Err(params.err("x_max", "crop window is empty"));
                }
                AugmentOp::Crop {
                    x_min,
                    y_min,
                    x_max,
                    y_max,
                    p,
                }
            }
            "RandomCrop" => {
                params.check_keys(&["width", "height"])?;
                let width = params.u32_req("width")?;
                let height = params.u32_req("height")?;
                if width == 0 || height == 0 {
                    return Err(params.err("width", "crop size must be non-empty"));
                }
                AugmentOp::RandomCrop { width, height, p }
            }
            "ElasticTransform" => {
                params.check_keys(&["alpha", "sigma", "interpolation", "border_mode"])?;
                AugmentOp::ElasticTransform {
                    alpha: params.f32_or("alpha", 1.0)?,
                    sigma: params.f32_or("sigma", 50.0)?,
                    interpolation: params.interpolation()?,
                    border: params.border()?,
                    p,
                }
            }
            "GridDistortion" => {
                params.check_keys(&["num_steps", "distort_limit", "interpolation", "border_mode"])?;
                let num_steps = params.u32_or("num_steps", 5)?;
                if num_steps == 0 {
                    return Err(params.err("num_steps", "must be at least 1"));
                }
                AugmentOp::GridDistortion {
                    num_steps,
                    distort_limit: params.range_or("distort_limit", 0.3, Span::Symmetric)?,
                    interpolation: params.interpolation()?,
                    border: params.border()?,
                    p,
                }
            }
            "OpticalDistortion" => {
                params.check_keys(&["distort_limit", "shift_limit", "interpolation", "border_mode"])?;
                AugmentOp::OpticalDistortion {
                    distort_limit: params.range_or("distort_limit", 0.05, Span::Symmetric)?,
                    shift_limit: params.range_or("shift_limit", 0.05, Span::Symmetric)?,
                    interpolation: params.interpolation()?,
                    border: params.border()?,
                    p,
                }
            }
            "ColorJitter" => {
                params.check_keys(&["brightness", "contrast", "saturation", "hue"])?;
                let hue = params.range_or("hue", 0.2, Span::Symmetric)?;
                if hue.0 < -0.5 || hue.1 > 0.5 {
                    return Err(params.err("hue", "must stay within [-0.5, 0.5]"));
                }
                AugmentOp::ColorJitter {
                    brightness: params.range_or("brightness", 0.2, Span::AroundOne)?,
                    contrast: params.range_or("contrast", 0.2, Span::AroundOne)?,
                    saturation: params.range_or("saturation", 0.2, Span::AroundOne)?,
                    hue,
                    p,
                }
            }
            "RandomBrightnessContrast" => {
                params.check_keys(&["brightness_limit", "contrast_limit"])?;
                AugmentOp::RandomBrightnessContrast {
                    brightness_limit: params.range_or("brightness_limit", 0.2, Span::Symmetric)?,
                    contrast_limit: params.range_or("contrast_limit", 0.2, Span::Symmetric)?,
                    p,
                }
            }
            "GaussNoise" => {
                params.check_keys(&["var_limit"])?;
                let var_limit = match params.raw.get("var_limit") {
                    None => (10.0, 50.0),
                    Some(_) => params.range_or("var_limit", 0.0, Span::FromZero)?,
                };
                if var_limit.0 < 0.0 {
                    return Err(params.err("var_limit", "variance cannot be negative"));
                }
                AugmentOp::GaussNoise { var_limit, p }
            }
            "GaussianBlur" => {
                params.check_keys(&["sigma_limit"])?;
                let sigma_limit = match params.raw.get("sigma_limit") {
                    None => (0.5, 1.5),
                    Some(_) => params.range_or("sigma_limit", 0.0, Span::FromZero)?,
                };
                AugmentOp::GaussianBlur { sigma_limit, p }
            }
            _ => {
                params.check_keys(&[])?;
                AugmentOp::ToGray { p }
            }
        };
        Ok(resolved)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AugmentOp::Rotate { .. } => "Rotate",
            AugmentOp::HorizontalFlip { .. } => "HorizontalFlip",
            AugmentOp::VerticalFlip { .. } => "VerticalFlip",
            AugmentOp::Flip { .. } => "Flip",
            AugmentOp::Resize { .. } => "Resize",
            AugmentOp::Crop { .. } => "Crop",
            AugmentOp::RandomCrop { .. } => "RandomCrop",
            AugmentOp::ElasticTransform { .. } => "ElasticTransform",
            AugmentOp::GridDistortion { .. } => "GridDistortion",
            AugmentOp::OpticalDistortion { .. } => "OpticalDistortion",
            AugmentOp::ColorJitter { .. } => "ColorJitter",
            AugmentOp::RandomBrightnessContrast { .. } => "RandomBrightnessContrast",
            AugmentOp::GaussNoise { .. } => "GaussNoise",
            AugmentOp::GaussianBlur { .. } => "GaussianBlur",
            AugmentOp::ToGray { .. } => "ToGray",
        }
    }

    pub fn is_spatial(&self) -> bool {
        !matches!(
            self,
            AugmentOp::ColorJitter { .. }
                | AugmentOp::RandomBrightnessContrast { .. }
                | AugmentOp::GaussNoise { .. }
                | AugmentOp::GaussianBlur { .. }
                | AugmentOp::ToGray { .. }
        )
    }

    fn probability(&self) -> f32 {
        match *self {
            AugmentOp::Rotate { p, .. }
            | AugmentOp::HorizontalFlip { p }
            | AugmentOp::VerticalFlip { p }
            | AugmentOp::Flip { p }
            | AugmentOp::Resize { p, .. }
            | AugmentOp::Crop { p, .. }
            | AugmentOp::RandomCrop { p, .. }
            | AugmentOp::ElasticTransform { p, .. }
            | AugmentOp::GridDistortion { p, .. }
            | AugmentOp::OpticalDistortion { p, .. }
            | AugmentOp::ColorJitter { p, .. }
            | AugmentOp::RandomBrightnessContrast { p, .. }
            | AugmentOp::GaussNoise { p, .. }
            | AugmentOp::GaussianBlur { p, .. }
            | AugmentOp::ToGray { p } => p,
        }
    }

    /// Draw every random parameter of this op, or `None` if it does not fire.
    fn realize(&self, rng: &mut dyn RngCore, width: u32, height: u32) -> Option<AppliedStep> {
        if rng.random::<f32>() >= self.probability() {
            return None;
        }
        let step = match self {
            AugmentOp::Rotate {
                limit,
                interpolation,
                border,
                ..
            } => AppliedStep::Spatial(SpatialStep::Rotate {
                angle: uniform(rng, *limit),
                interpolation: *interpolation,
                border: *border,
            }),
            AugmentOp::HorizontalFlip { .. } => AppliedStep::Spatial(SpatialStep::Flip {
                axis: FlipAxis::Horizontal,
            }),
            AugmentOp::VerticalFlip { .. } => AppliedStep::Spatial(SpatialStep::Flip {
                axis: FlipAxis::Vertical,
            }),
            AugmentOp::Flip { .. } => {
                let axis = match rng.random_range(-1i32..=1) {
                    -1 => FlipAxis::Both,
                    0 => FlipAxis::Vertical,
                    _ => FlipAxis::Horizontal,
                };
                AppliedStep::Spatial(SpatialStep::Flip { axis })
            }
            AugmentOp::Resize {
                width,
                height,
                interpolation,
                ..
            } => AppliedStep::Spatial(SpatialStep::Resize {
                width: *width,
                height: *height,
                interpolation: *interpolation,
            }),
            AugmentOp::Crop {
                x_min,
                y_min,
                x_max,
                y_max,
                ..
            } => AppliedStep::Spatial(SpatialStep::Crop {
                x_min: *x_min,
                y_min: *y_min,
                x_max: *x_max,
                y_max: *y_max,
            }),
            AugmentOp::RandomCrop { width, height, .. } => {
                AppliedStep::Spatial(SpatialStep::RandomCrop {
                    width: *width,
                    height: *height,
                    h_start: rng.random::<f32>(),
                    w_start: rng.random::<f32>(),
                })
            }
            AugmentOp::ElasticTransform {
                alpha,
                sigma,
                interpolation,
                border,
                ..
            } => AppliedStep::Spatial(SpatialStep::ElasticTransform {
                alpha: *alpha,
                sigma: *sigma,
                seed: rng.random::<u64>(),
                interpolation: *interpolation,
                border: *border,
            }),
            AugmentOp::GridDistortion {
                num_steps,
                distort_limit,
                interpolation,
                border,
                ..
            } => {
                let xsteps = grid_steps(rng, *num_steps, *distort_limit);
                let ysteps = grid_steps(rng, *num_steps, *distort_limit);
                AppliedStep::Spatial(SpatialStep::GridDistortion {
                    num_steps: *num_steps,
                    xsteps,
                    ysteps,
                    interpolation: *interpolation,
                    border: *border,
                })
            }
            AugmentOp::OpticalDistortion {
                distort_limit,
                shift_limit,
                interpolation,
                border,
                ..
            } => {
                let k = uniform(rng, *distort_limit);
                let dx = (uniform(rng, *shift_limit) * width as f32).round();
                let dy = (uniform(rng, *shift_limit) * height as f32).round();
                AppliedStep::Spatial(SpatialStep::OpticalDistortion {
                    k,
                    dx,
                    dy,
                    interpolation: *interpolation,
                    border: *border,
                })
            }
            AugmentOp::ColorJitter {
                brightness,
                contrast,
                saturation,
                hue,
                ..
            } => {
                let mut order = [0u8, 1, 2, 3];
                order.shuffle(rng);
                AppliedStep::Photometric(PhotometricStep::ColorJitter {
                    brightness: uniform(rng, *brightness),
                    contrast: uniform(rng, *contrast),
                    saturation: uniform(rng, *saturation),
                    hue: uniform(rng, *hue),
                    order,
                })
            }
            AugmentOp::RandomBrightnessContrast {
                brightness_limit,
                contrast_limit,
                ..
            } => AppliedStep::Photometric(PhotometricStep::BrightnessContrast {
                alpha: 1.0 + uniform(rng, *contrast_limit),
                beta: uniform(rng, *brightness_limit),
            }),
            AugmentOp::GaussNoise { var_limit, .. } => {
                AppliedStep::Photometric(PhotometricStep::GaussNoise {
                    sigma: uniform(rng, *var_limit).sqrt(),
                    seed: rng.random::<u64>(),
                })
            }
            AugmentOp::GaussianBlur { sigma_limit, .. } => {
                AppliedStep::Photometric(PhotometricStep::GaussianBlur {
                    sigma: uniform(rng, *sigma_limit),
                })
            }
            AugmentOp::ToGray { .. } => AppliedStep::Photometric(PhotometricStep::ToGray),
        };
        Some(step)
    }
}

/// A geometric transform with every random parameter fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpatialStep {
    Rotate {
        angle: f32,
        interpolation: Interpolation,
        border: BorderMode,
    },
    Flip {
        axis: FlipAxis,
    },
    Resize {
        width: u32,
        height: u32,
        interpolation: Interpolation,
    },
    Crop {
        x_min: u32,
        y_min: u32,
        x_max: u32,
        y_max: u32,
    },
    /// Offsets are fractions of the available slack so the step replays on any size.
    RandomCrop {
        width: u32,
        height: u32,
        h_start: f32,
        w_start: f32,
    },
    ElasticTransform {
        alpha: f32,
        sigma: f32,
        seed: u64,
        interpolation: Interpolation,
        border: BorderMode,
    },
    GridDistortion {
        num_steps: u32,
        xsteps: Vec<f32>,
        ysteps: Vec<f32>,
        interpolation: Interpolation,
        border: BorderMode,
    },
    OpticalDistortion {
        k: f32,
        dx: f32,
        dy: f32,
        interpolation: Interpolation,
        border: BorderMode,
    },
}

impl SpatialStep {
    pub fn apply(&self, img: &RgbImage) -> RgbImage {
        match self {
            SpatialStep::Rotate {
                angle,
                interpolation,
                border,
            } => warp::rotate(img, *angle, *interpolation, *border),
            SpatialStep::Flip { axis } => match axis {
                FlipAxis::Horizontal => imageops::flip_horizontal(img),
                FlipAxis::Vertical => imageops::flip_vertical(img),
                FlipAxis::Both => imageops::rotate180(img),
            },
            SpatialStep::Resize {
                width,
                height,
                interpolation,
            } => imageops::resize(img, *width, *height, interpolation.filter()),
            SpatialStep::Crop {
                x_min,
                y_min,
                x_max,
                y_max,
            } => imageops::crop_imm(img, *x_min, *y_min, x_max - x_min, y_max - y_min).to_image(),
            SpatialStep::RandomCrop {
                width,
                height,
                h_start,
                w_start,
            } => {
                let (w, h) = img.dimensions();
                let cw = (*width).min(w);
                let ch = (*height).min(h);
                let x = (((w - cw + 1) as f32 * w_start) as u32).min(w - cw);
                let y = (((h - ch + 1) as f32 * h_start) as u32).min(h - ch);
                imageops::crop_imm(img, x, y, cw, ch).to_image()
            }
            SpatialStep::ElasticTransform {
                alpha,
                sigma,
                seed,
                interpolation,
                border,
            } => warp::elastic(img, *alpha, *sigma, *seed, *interpolation, *border),
            SpatialStep::GridDistortion {
                num_steps,
                xsteps,
                ysteps,
                interpolation,
                border,
            } => warp::grid_distortion(img, *num_steps, xsteps, ysteps, *interpolation, *border),
            SpatialStep::OpticalDistortion {
                k,
                dx,
                dy,
                interpolation,
                border,
            } => warp::optical_distortion(img, *k, *dx, *dy, *interpolation, *border),
        }
    }
}

/// A pixel-value transform with every random parameter fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhotometricStep {
    ColorJitter {
        brightness: f32,
        contrast: f32,
        saturation: f32,
        hue: f32,
        order: [u8; 4],
    },
    BrightnessContrast {
        alpha: f32,
        beta: f32,
    },
    GaussNoise {
        sigma: f32,
        seed: u64,
    },
    GaussianBlur {
        sigma: f32,
    },
    ToGray,
}

fn luma(px: [f32; 3]) -> f32 {
    0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2]
}

fn map_pixels(img: &mut RgbImage, mut f: impl FnMut([f32; 3]) -> [f32; 3]) {
    for pixel in img.pixels_mut() {
        let out = f([pixel[0] as f32, pixel[1] as f32, pixel[2] as f32]);
        *pixel = Rgb(out.map(|v| v.round().clamp(0.0, 255.0) as u8));
    }
}

fn mean_luma(img: &RgbImage) -> f32 {
    let n = (img.width() as u64 * img.height() as u64).max(1) as f32;
    img.pixels()
        .map(|p| luma([p[0] as f32, p[1] as f32, p[2] as f32]))
        .sum::<f32>()
        / n
}

fn shift_hue(px: [f32; 3], shift: f32) -> [f32; 3] {
    let [r, g, b] = px.map(|v| v / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= f32::EPSILON {
        return px;
    }
    let sector = if max == r {
        ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    let hue = (sector / 6.0 + shift).rem_euclid(1.0);
    let sat = delta / max;
    let h6 = hue * 6.0;
    let c = max * sat;
    let x = c * (1.0 - (h6.rem_euclid(2.0) - 1.0).abs());
    let m = max - c;
    let (r, g, b) = match h6 as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [(r + m) * 255.0, (g + m) * 255.0, (b + m) * 255.0]
}

impl PhotometricStep {
    pub fn apply(&self, img: &mut RgbImage) {
        match self {
            PhotometricStep::ColorJitter {
                brightness,
                contrast,
                saturation,
                hue,
                order,
            } => {
                for stage in *order {
                    match stage {
                        0 => map_pixels(img, |p| p.map(|v| v * brightness)),
                        1 => {
                            let mean = mean_luma(img);
                            map_pixels(img, |p| p.map(|v| (v - mean) * contrast + mean));
                        }
                        2 => map_pixels(img, |p| {
                            let gray = luma(p);
                            p.map(|v| gray + (v - gray) * saturation)
                        }),
                        _ => {
                            if *hue != 0.0 {
                                map_pixels(img, |p| shift_hue(p, *hue));
                            }
                        }
                    }
                }
            }
            PhotometricStep::BrightnessContrast { alpha, beta } => {
                let offset = beta * 255.0;
                map_pixels(img, |p| p.map(|v| v * alpha + offset));
            }
            PhotometricStep::GaussNoise { sigma, seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                if let Ok(normal) = Normal::new(0.0f32, *sigma) {
                    map_pixels(img, |p| p.map(|v| v + normal.sample(&mut rng)));
                }
            }
            PhotometricStep::GaussianBlur { sigma } => {
                if *sigma > 0.0 {
                    *img = imageops::blur(img, *sigma);
                }
            }
            PhotometricStep::ToGray => map_pixels(img, |p| {
                let gray = luma(p);
                [gray, gray, gray]
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppliedStep {
    Spatial(SpatialStep),
    Photometric(PhotometricStep),
}

/// Every step executed by one pipeline run, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AugmentationTrace {
    pub steps: Vec<AppliedStep>,
}

impl AugmentationTrace {
    pub fn replay_record(&self) -> ReplayRecord {
        ReplayRecord {
            steps: self
                .steps
                .iter()
                .filter_map(|step| match step {
                    AppliedStep::Spatial(s) => Some(s.clone()),
                    AppliedStep::Photometric(_) => None,
                })
                .collect(),
        }
    }
}

/// The spatial steps of one augmentation run, replayable onto paired images.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    steps: Vec<SpatialStep>,
}

impl ReplayRecord {
    pub fn new(steps: Vec<SpatialStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[SpatialStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn replay(&self, img: &RgbImage) -> RgbImage {
        let mut out = img.clone();
        for step in &self.steps {
            out = step.apply(&out);
        }
        out
    }
}

/// Resolved, immutable list of operations shared by every item of a dataset.
#[derive(Debug, Clone)]
pub struct AugmentationPipeline {
    ops: Arc<[AugmentOp]>,
    shuffle: bool,
}

impl AugmentationPipeline {
    /// `Ok(None)` for an empty spec list.
    pub fn from_specs(specs: &[AugmentSpec], shuffle: bool) -> DatasetResult<Option<Self>> {
        if specs.is_empty() {
            return Ok(None);
        }
        let ops = specs
            .iter()
            .map(AugmentOp::from_spec)
            .collect::<DatasetResult<Vec<_>>>()?;
        Ok(Some(Self {
            ops: ops.into(),
            shuffle,
        }))
    }

    pub fn ops(&self) -> &[AugmentOp] {
        &self.ops
    }

    pub fn shuffles(&self) -> bool {
        self.shuffle
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.ops.iter().map(AugmentOp::name).collect()
    }

    pub fn compose(&self, rng: &mut dyn RngCore) -> ComposedPipeline {
        let mut composed = ComposedPipeline {
            pipeline: self.clone(),
            order: (0..self.ops.len()).collect(),
        };
        composed.recompose(rng);
        composed
    }
}

/// A pipeline with a fixed execution order.
#[derive(Debug, Clone)]
pub struct ComposedPipeline {
    pipeline: AugmentationPipeline,
    order: Vec<usize>,
}

impl ComposedPipeline {
    /// Draw a fresh order when shuffling is configured; otherwise a no-op.
    pub fn recompose(&mut self, rng: &mut dyn RngCore) {
        if self.pipeline.shuffle {
            self.order.shuffle(rng);
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.order
            .iter()
            .map(|&i| self.pipeline.ops[i].name())
            .collect()
    }

    pub fn apply(&self, img: RgbImage, rng: &mut dyn RngCore) -> (RgbImage, AugmentationTrace) {
        let mut img = img;
        let mut trace = AugmentationTrace::default();
        for &i in &self.order {
            let op = &self.pipeline.ops[i];
            let Some(step) = op.realize(rng, img.width(), img.height()) else {
                continue;
            };
            match &step {
                AppliedStep::Spatial(s) => img = s.apply(&img),
                AppliedStep::Photometric(p) => p.apply(&mut img),
            }
            trace.steps.push(step);
        }
        (img, trace)
    }
}
