//! Aspect-ratio buckets: target resolutions, per-item geometry and batch index lists.

use crate::config::DatasetConfig;
use crate::item::{FileItem, Geometry};
use crate::poi::{setup_poi_bucket, PoiOutcome};
use crate::rng::{epoch_stream, item_stream, StreamKind};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Edge length the reference table is laid out for.
pub const BASE_RESOLUTION: u32 = 1024;

/// SDXL bucket list at a 1024x1024 pixel budget.
const RESOLUTIONS_1024: [(u32, u32); 41] = [
    (1024, 1024),
    // landscape
    (2048, 512),
    (1984, 512),
    (1920, 512),
    (1856, 512),
    (1792, 576),
    (1728, 576),
    (1664, 576),
    (1600, 640),
    (1536, 640),
    (1472, 704),
    (1408, 704),
    (1344, 704),
    (1344, 768),
    (1280, 768),
    (1216, 832),
    (1152, 832),
    (1152, 896),
    (1088, 896),
    (1088, 960),
    (1024, 960),
    // portrait
    (512, 2048),
    (512, 1984),
    (512, 1920),
    (512, 1856),
    (576, 1792),
    (576, 1728),
    (576, 1664),
    (640, 1600),
    (640, 1536),
    (704, 1472),
    (704, 1408),
    (704, 1344),
    (768, 1344),
    (768, 1280),
    (832, 1216),
    (832, 1152),
    (896, 1152),
    (896, 1088),
    (960, 1088),
    (960, 1024),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketResolution {
    pub width: u32,
    pub height: u32,
}

impl BucketResolution {
    pub fn key(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Square-equivalent edge length.
pub fn get_resolution(width: u32, height: u32) -> u32 {
    ((width as f64) * (height as f64)).sqrt() as u32
}

/// The reference table scaled to `resolution` with both axes rounded down to a
/// multiple of `divisibility`.
pub fn bucket_sizes(resolution: u32, divisibility: u32) -> Vec<BucketResolution> {
    let divisibility = divisibility.max(1);
    let scaler = resolution as f64 / BASE_RESOLUTION as f64;
    let snap = |v: u32| (v - v % divisibility).max(divisibility);
    let mut out: Vec<BucketResolution> = Vec::with_capacity(RESOLUTIONS_1024.len());
    for (w, h) in RESOLUTIONS_1024 {
        let bucket = BucketResolution {
            width: snap((w as f64 * scaler) as u32),
            height: snap((h as f64 * scaler) as u32),
        };
        if !out.contains(&bucket) {
            out.push(bucket);
        }
    }
    out
}

/// Pick the bucket that discards the fewest pixels after cover-scaling.
pub fn bucket_for_image_size(
    width: u32,
    height: u32,
    resolution: u32,
    divisibility: u32,
) -> BucketResolution {
    let sizes = bucket_sizes(resolution, divisibility);
    best_bucket(width, height, &sizes)
}

fn best_bucket(width: u32, height: u32, sizes: &[BucketResolution]) -> BucketResolution {
    if let Some(exact) = sizes
        .iter()
        .find(|b| b.width == width && b.height == height)
    {
        return *exact;
    }
    let (w, h) = (width.max(1) as f64, height.max(1) as f64);
    let mut best = sizes[0];
    let mut least_removed = u64::MAX;
    for bucket in sizes {
        let scale = f64::max(bucket.width as f64 / w, bucket.height as f64 / h);
        let new_w = ((w * scale) as u64).max(bucket.width as u64);
        let new_h = ((h * scale) as u64).max(bucket.height as u64);
        let removed = (new_w - bucket.width as u64) * new_h + (new_h - bucket.height as u64) * new_w;
        if removed < least_removed {
            least_removed = removed;
            best = *bucket;
            if removed == 0 {
                break;
            }
        }
    }
    best
}

/// Enlarge `(width, height)` to cover `bucket` and place the crop window.
pub fn fit_to_bucket(
    width: u32,
    height: u32,
    bucket: BucketResolution,
    random_crop: bool,
    rng: &mut dyn RngCore,
) -> Geometry {
    let factor = f64::max(
        bucket.width as f64 / width.max(1) as f64,
        bucket.height as f64 / height.max(1) as f64,
    );
    let scale_to_width = ((width as f64 * factor).ceil() as u32).max(bucket.width);
    let scale_to_height = ((height as f64 * factor).ceil() as u32).max(bucket.height);
    let slack_x = scale_to_width - bucket.width;
    let slack_y = scale_to_height - bucket.height;
    let (crop_x, crop_y) = if random_crop {
        (rng.random_range(0..=slack_x), rng.random_range(0..=slack_y))
    } else {
        (slack_x / 2, slack_y / 2)
    };
    Geometry {
        scale_to_width,
        scale_to_height,
        crop_x,
        crop_y,
        crop_width: bucket.width,
        crop_height: bucket.height,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub width: u32,
    pub height: u32,
    pub indices: Vec<usize>,
}

impl Bucket {
    pub fn key(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Buckets in first-use order.
#[derive(Debug, Clone, Default)]
pub struct BucketSet {
    buckets: Vec<Bucket>,
    by_key: HashMap<(u32, u32), usize>,
}

impl BucketSet {
    pub fn insert(&mut self, width: u32, height: u32, index: usize) {
        let pos = *self.by_key.entry((width, height)).or_insert_with(|| {
            self.buckets.push(Bucket {
                width,
                height,
                indices: Vec::new(),
            });
            self.buckets.len() - 1
        });
        self.buckets[pos].indices.push(index);
    }

    pub fn get(&self, key: &str) -> Option<&Bucket> {
        self.buckets.iter().find(|b| b.key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn shuffle(&mut self, rng: &mut dyn RngCore) {
        for bucket in &mut self.buckets {
            bucket.indices.shuffle(rng);
        }
    }
}

/// Split every bucket into batches; a trailing partial batch is kept.
pub fn build_batch_indices(buckets: &BucketSet, batch_size: usize) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    buckets
        .iter()
        .flat_map(|b| b.indices.chunks(batch_size).map(<[usize]>::to_vec))
        .collect()
}

/// Assigns geometry to items and groups them into buckets.
pub struct BucketAssigner<'a> {
    config: &'a DatasetConfig,
    seed: u64,
}

impl<'a> BucketAssigner<'a> {
    pub fn new(config: &'a DatasetConfig, seed: u64) -> Self {
        Self { config, seed }
    }

    /// Natural size after the configured pre-scale.
    pub fn scaled_size(&self, width: u32, height: u32) -> (u32, u32) {
        (
            (width as f64 * self.config.scale) as u32,
            (height as f64 * self.config.scale) as u32,
        )
    }

    /// Standard (non-PoI) geometry for one item.
    pub fn assign_standard(&self, item: &mut FileItem, rng: &mut dyn RngCore) {
        let (width, height) = self.scaled_size(item.width, item.height);
        let bucket = bucket_for_image_size(
            width,
            height,
            self.config.resolution,
            self.config.bucket_tolerance,
        );
        item.geometry = fit_to_bucket(width, height, bucket, self.config.random_crop, rng);
        if let Some(poi) = item.poi.as_mut() {
            poi.in_crop = None;
        }
    }

    /// Recompute every item's geometry and regroup them for `epoch`.
    pub fn assign(&self, items: &mut [FileItem], epoch: usize) -> BucketSet {
        let mut buckets = BucketSet::default();
        for (index, item) in items.iter_mut().enumerate() {
            let mut rng = item_stream(self.seed, index, epoch, StreamKind::Geometry);
            let placed = match item.oriented_poi() {
                Some(region) => match setup_poi_bucket(item.width, item.height, region, self.config, &mut rng) {
                    PoiOutcome::Handled(placement) => {
                        item.geometry = placement.geometry;
                        if let Some(poi) = item.poi.as_mut() {
                            poi.in_crop = Some(placement.region_in_crop);
                        }
                        true
                    }
                    PoiOutcome::NotHandled => false,
                    PoiOutcome::Exhausted => {
                        warn!(
                            path = %item.path.display(),
                            "no crop window around the point of interest reached the target resolution; using standard bucketing"
                        );
                        false
                    }
                },
                None => false,
            };
            if !placed {
                self.assign_standard(item, &mut rng);
            }
            if !item.geometry.is_consistent() {
                warn!(
                    path = %item.path.display(),
                    geometry = ?item.geometry,
                    "size mismatch: crop exceeds the scaled image"
                );
            }
            buckets.insert(item.geometry.crop_width, item.geometry.crop_height, index);
        }
        buckets.shuffle(&mut epoch_stream(self.seed, epoch));
        for bucket in buckets.iter() {
            info!(bucket = %bucket.key(), items = bucket.indices.len(), "bucket");
        }
        debug!(buckets = buckets.len(), epoch, "bucket assignment finished");
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn resolution_is_square_equivalent() {
        assert_eq!(get_resolution(512, 512), 512);
        assert_eq!(get_resolution(1024, 256), 512);
        assert_eq!(get_resolution(1600, 1200), 1385);
    }

    #[test]
    fn sizes_snap_to_tolerance() {
        let sizes = bucket_sizes(512, 64);
        assert_eq!(sizes[0], BucketResolution { width: 512, height: 512 });
        assert!(sizes.iter().all(|b| b.width % 64 == 0 && b.height % 64 == 0));
        let mut keys: Vec<_> = sizes.iter().map(BucketResolution::key).collect();
        let before = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), before);
    }

    #[test]
    fn exact_size_wins() {
        let bucket = bucket_for_image_size(640, 384, 512, 64);
        assert_eq!(bucket, BucketResolution { width: 640, height: 384 });
    }

    #[test]
    fn four_by_three_picks_least_loss() {
        assert_eq!(
            bucket_for_image_size(1600, 1200, 512, 64),
            BucketResolution { width: 576, height: 448 }
        );
        assert_eq!(
            bucket_for_image_size(1200, 1600, 512, 64),
            BucketResolution { width: 448, height: 576 }
        );
    }

    #[test]
    fn fitted_geometry_covers_crop() {
        let mut rng = StdRng::seed_from_u64(3);
        let bucket = BucketResolution { width: 512, height: 512 };
        for (w, h) in [(600, 600), (1000, 700), (513, 2000), (300, 300)] {
            for random_crop in [false, true] {
                let g = fit_to_bucket(w, h, bucket, random_crop, &mut rng);
                assert!(g.is_consistent(), "{w}x{h}: {g:?}");
                assert_eq!((g.crop_width, g.crop_height), (512, 512));
            }
        }
        let centered = fit_to_bucket(600, 512, bucket, false, &mut rng);
        assert_eq!((centered.scale_to_width, centered.crop_x), (600, 44));
    }

    #[test]
    fn trailing_partial_batch_is_kept() {
        let mut set = BucketSet::default();
        for i in 0..5 {
            set.insert(512, 512, i);
        }
        set.insert(448, 576, 5);
        let batches = build_batch_indices(&set, 2);
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[2], vec![4]);
        assert_eq!(batches[3], vec![5]);
    }
}
