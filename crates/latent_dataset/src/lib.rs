//! Aspect-ratio bucketing, replayable augmentation and latent caching for image datasets.
//!
//! This crate provides utilities for:
//! - Building per-image item records with their companion images
//! - Assigning items to fixed-resolution buckets (optionally around a region of interest)
//! - Augmenting a primary image and replaying its spatial transforms on companions
//! - Content-addressed caching of encoder latents on disk and in memory
//! - Burn-compatible batch assembly

pub mod aug;
pub mod buckets;
pub mod cache;
pub mod caption;
pub mod config;
pub mod dataset;
pub mod item;
pub mod poi;
pub mod processing;
pub mod rng;
pub mod tensor;
pub mod types;
pub mod warp;

pub use aug::{
    AppliedStep, AugmentOp, AugmentationPipeline, AugmentationTrace, BorderMode,
    ComposedPipeline, FlipAxis, Interpolation, PhotometricStep, ReplayRecord, SpatialStep,
};
pub use buckets::{
    bucket_for_image_size, bucket_sizes, build_batch_indices, get_resolution, Bucket,
    BucketAssigner, BucketResolution, BucketSet,
};
pub use cache::{
    latent_hash, latent_path_for, orphaned_files, prune_orphans, read_latent, write_latent,
    CachePassReport, CachePolicy, LatentEncoder, DEFAULT_LATENT_SPACE_VERSION, LATENT_CACHE_DIR,
};
pub use config::{AugmentSpec, DatasetConfig, ResolvedAugmentations};
pub use dataset::{DatasetBatch, LatentDataset};
pub use item::{Companion, FileItem, Geometry, LatentState, MaskCompanion, MaskSource, PoiState};
pub use poi::{setup_poi_bucket, PoiOutcome, PoiPlacement, MAX_POI_ATTEMPTS};
pub use tensor::{ImageTensor, LatentTensor};
pub use types::{DatasetError, DatasetResult};
