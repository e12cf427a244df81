//! Crop placement around a point of interest.
//!
//! A random window is grown around the region until it holds at least the
//! target resolution; the window picks the bucket and the crop is placed so the
//! scaled region stays entirely inside it.

use crate::buckets::{bucket_for_image_size, get_resolution};
use crate::config::DatasetConfig;
use crate::item::Geometry;
use data_contracts::PixelRect;
use rand::{Rng, RngCore};

pub const MAX_POI_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoiPlacement {
    pub geometry: Geometry,
    /// Window in pre-scaled image coordinates that selected the bucket.
    pub window: PixelRect,
    /// Enlargement from pre-scaled coordinates to `scale_to_*`.
    pub factor: f64,
    /// The region reprojected into crop coordinates.
    pub region_in_crop: PixelRect,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoiOutcome {
    Handled(PoiPlacement),
    /// The image is already at or below the target resolution.
    NotHandled,
    /// No window satisfied the constraints within [`MAX_POI_ATTEMPTS`].
    Exhausted,
}

/// `region` is in natural image pixels, already mirrored for any flips.
pub fn setup_poi_bucket(
    width: u32,
    height: u32,
    region: PixelRect,
    config: &DatasetConfig,
    rng: &mut dyn RngCore,
) -> PoiOutcome {
    let scale = config.scale;
    let initial_width = (width as f64 * scale) as u32;
    let initial_height = (height as f64 * scale) as u32;
    if get_resolution(initial_width, initial_height) <= config.resolution {
        return PoiOutcome::NotHandled;
    }

    let (rx0, rx1) = scaled_span(region.x, region.right(), scale, initial_width);
    let (ry0, ry1) = scaled_span(region.y, region.bottom(), scale, initial_height);

    let (mut x0, mut x1, mut y0, mut y1) = (rx0, rx1, ry0, ry1);
    for _ in 0..MAX_POI_ATTEMPTS {
        // bounds only ever grow, so the window keeps enclosing the region
        x0 = rng.random_range(0..=x0);
        x1 = rng.random_range(x1..=initial_width);
        y0 = rng.random_range(0..=y0);
        y1 = rng.random_range(y1..=initial_height);
        let (win_w, win_h) = (x1 - x0, y1 - y0);
        if get_resolution(win_w, win_h) < config.resolution {
            continue;
        }

        let bucket = bucket_for_image_size(win_w, win_h, config.resolution, config.bucket_tolerance);
        let factor = f64::max(
            bucket.width as f64 / win_w as f64,
            bucket.height as f64 / win_h as f64,
        );
        let scale_to_width = ((initial_width as f64 * factor).ceil() as u32).max(bucket.width);
        let scale_to_height = ((initial_height as f64 * factor).ceil() as u32).max(bucket.height);

        let sx0 = (rx0 as f64 * factor).floor() as u32;
        let sx1 = ((rx1 as f64 * factor).ceil() as u32).min(scale_to_width);
        let sy0 = (ry0 as f64 * factor).floor() as u32;
        let sy1 = ((ry1 as f64 * factor).ceil() as u32).min(scale_to_height);
        if sx1 - sx0 > bucket.width || sy1 - sy0 > bucket.height {
            continue;
        }

        let crop_x = place_crop(sx0, sx1, bucket.width, scale_to_width, x0 as f64 * factor);
        let crop_y = place_crop(sy0, sy1, bucket.height, scale_to_height, y0 as f64 * factor);
        return PoiOutcome::Handled(PoiPlacement {
            geometry: Geometry {
                scale_to_width,
                scale_to_height,
                crop_x,
                crop_y,
                crop_width: bucket.width,
                crop_height: bucket.height,
            },
            window: PixelRect::new(x0, y0, win_w, win_h),
            factor,
            region_in_crop: PixelRect::new(sx0 - crop_x, sy0 - crop_y, sx1 - sx0, sy1 - sy0),
        });
    }
    PoiOutcome::Exhausted
}

/// Pre-scale a `[start, end)` span, keeping it non-empty and inside `extent`.
fn scaled_span(start: u32, end: u32, scale: f64, extent: u32) -> (u32, u32) {
    let s = ((start as f64 * scale).floor() as u32).min(extent.saturating_sub(1));
    let e = ((end as f64 * scale).ceil() as u32).clamp(s + 1, extent);
    (s, e)
}

/// Crop offset nearest `preferred` such that `[start, end)` fits in the crop
/// and the crop fits in `extent`. Callers guarantee `end - start <= crop <= extent`.
fn place_crop(start: u32, end: u32, crop: u32, extent: u32, preferred: f64) -> u32 {
    let lo = end.saturating_sub(crop);
    let hi = start.min(extent - crop);
    (preferred.floor().max(0.0) as u32).clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> DatasetConfig {
        DatasetConfig {
            resolution: 512,
            bucket_tolerance: 64,
            ..Default::default()
        }
    }

    #[test]
    fn small_images_are_not_handled() {
        let mut rng = StdRng::seed_from_u64(0);
        let out = setup_poi_bucket(500, 500, PixelRect::new(10, 10, 50, 50), &config(), &mut rng);
        assert_eq!(out, PoiOutcome::NotHandled);
    }

    #[test]
    fn region_lands_inside_crop() {
        let cfg = config();
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let region = PixelRect::new(1200, 300, 200, 260);
            let PoiOutcome::Handled(p) = setup_poi_bucket(2000, 1500, region, &cfg, &mut rng) else {
                panic!("seed {seed} did not place a crop");
            };
            let g = p.geometry;
            assert!(g.is_consistent());
            let crop = PixelRect::new(0, 0, g.crop_width, g.crop_height);
            assert!(crop.contains(&p.region_in_crop), "seed {seed}: {p:?}");
            assert!(p.window.contains(&region));
            assert!(get_resolution(p.window.width, p.window.height) >= cfg.resolution);
        }
    }

    #[test]
    fn oversized_region_exhausts() {
        let mut rng = StdRng::seed_from_u64(9);
        // a long thin region cannot fit any crop at this resolution
        let out = setup_poi_bucket(4000, 600, PixelRect::new(0, 0, 4000, 20), &config(), &mut rng);
        assert_eq!(out, PoiOutcome::Exhausted);
    }

    #[test]
    fn crop_placement_respects_bounds() {
        assert_eq!(place_crop(100, 200, 150, 400, 0.0), 50);
        assert_eq!(place_crop(100, 200, 150, 400, 380.0), 100);
        assert_eq!(place_crop(100, 200, 150, 400, 70.0), 70);
    }
}
