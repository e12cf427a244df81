//! Shared data contracts for dataset sidecars and latent cache metadata.

pub mod latent;
pub mod sidecar;

pub use latent::LatentInfo;
pub use sidecar::{CaptionSidecar, PixelRect, PoiRegion, ValidationError};
