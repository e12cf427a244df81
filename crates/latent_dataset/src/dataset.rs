//! Dataset orchestration: items, buckets, the latent cache pass and batch assembly.

use crate::buckets::{build_batch_indices, BucketAssigner, BucketSet};
use crate::cache::{self, write_latent, CachePassReport, CachePolicy, LatentEncoder};
use crate::config::DatasetConfig;
use crate::item::FileItem;
use crate::processing::is_image_file;
use crate::rng::{epoch_stream, item_stream, resolve_seed, StreamKind};
use crate::tensor::{ImageTensor, LatentTensor};
use crate::types::{DatasetError, DatasetResult};
use burn::tensor::{backend::Backend, DType, Tensor};
use data_contracts::PixelRect;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One bucket-uniform batch. Tensor fields are `None` unless every loaded item provides them.
pub struct DatasetBatch<B: Backend> {
    pub indices: Vec<usize>,
    pub captions: Vec<String>,
    pub poi_in_crop: Vec<Option<PixelRect>>,
    /// `[N, 3, H, W]` in `[-1, 1]`.
    pub images: Option<Tensor<B, 4>>,
    pub unaugmented_images: Option<Tensor<B, 4>>,
    pub latents: Option<Tensor<B, 4>>,
    /// `[N, 3, H, W]` in `[0, 1]`.
    pub control: Option<Tensor<B, 4>>,
    /// `[N, 1, H, W]` in `[mask_min_value, 1]`.
    pub mask: Option<Tensor<B, 4>>,
    pub clip: Option<Tensor<B, 4>>,
    pub unconditional: Option<Tensor<B, 4>>,
    /// Items dropped from this batch because they failed to load.
    pub skipped: usize,
}

pub struct LatentDataset {
    config: Arc<DatasetConfig>,
    items: Vec<FileItem>,
    buckets: BucketSet,
    batch_indices: Vec<Vec<usize>>,
    seed: u64,
    epoch: usize,
    cursor: usize,
    encode_dtype: DType,
    skipped_errors: usize,
}

impl LatentDataset {
    /// Index every image directly under `config.folder_path`.
    pub fn new(config: DatasetConfig) -> DatasetResult<Self> {
        let root = config.folder_path.clone();
        let mut paths = Vec::new();
        for entry in fs::read_dir(&root).map_err(|e| DatasetError::io(&root, e))? {
            let path = entry.map_err(|e| DatasetError::io(&root, e))?.path();
            if path.is_file() && is_image_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Self::from_paths(config, paths)
    }

    pub fn from_paths(config: DatasetConfig, paths: Vec<PathBuf>) -> DatasetResult<Self> {
        let pipelines = config.validate()?;
        let seed = resolve_seed(config.seed);
        let config = Arc::new(config);

        let mut variants = vec![(false, false)];
        if config.flip_x {
            variants.push((true, false));
        }
        if config.flip_y {
            variants.push((false, true));
        }

        let mut items = Vec::with_capacity(paths.len() * variants.len());
        let mut skipped_errors = 0;
        for path in paths {
            for &(flip_x, flip_y) in &variants {
                let mut rng = item_stream(seed, items.len(), 0, StreamKind::Augment);
                match FileItem::new(path.clone(), config.clone(), &pipelines, flip_x, flip_y, &mut rng) {
                    Ok(item) => items.push(item),
                    Err(e) if e.is_item_recoverable() => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable image");
                        skipped_errors += 1;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if items.is_empty() {
            warn!(root = %config.folder_path.display(), "dataset has no usable images");
        }
        info!(items = items.len(), seed, "dataset indexed");

        let mut dataset = Self {
            config,
            items,
            buckets: BucketSet::default(),
            batch_indices: Vec::new(),
            seed,
            epoch: 0,
            cursor: 0,
            encode_dtype: DType::F32,
            skipped_errors,
        };
        dataset.setup_buckets();
        Ok(dataset)
    }

    /// Element type handed to the encoder during the cache pass.
    pub fn with_encode_dtype(mut self, dtype: DType) -> Self {
        self.encode_dtype = dtype;
        self
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn items(&self) -> &[FileItem] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [FileItem] {
        &mut self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn buckets(&self) -> &BucketSet {
        &self.buckets
    }

    pub fn batch_indices(&self) -> &[Vec<usize>] {
        &self.batch_indices
    }

    pub fn num_batches(&self) -> usize {
        self.batch_indices.len()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Items skipped so far because their images could not be loaded.
    pub fn skipped_errors(&self) -> usize {
        self.skipped_errors
    }

    /// Geometry is fixed after the first epoch unless a point of interest is
    /// configured; later epochs only reshuffle bucket order.
    fn setup_buckets(&mut self) {
        if self.epoch > 0 && self.config.poi.is_none() && !self.buckets.is_empty() {
            self.buckets.shuffle(&mut epoch_stream(self.seed, self.epoch));
        } else {
            let assigner = BucketAssigner::new(&self.config, self.seed);
            self.buckets = assigner.assign(&mut self.items, self.epoch);
        }
        self.batch_indices = build_batch_indices(&self.buckets, self.config.batch_size);
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.cursor = 0;
        self.setup_buckets();
    }

    pub fn set_latent_space_version(&mut self, version: &str) {
        for item in &mut self.items {
            item.latent.space_version = version.to_string();
        }
    }

    /// Encode and store the latent of every item not already cached.
    ///
    /// Unreadable images are skipped and counted; encoder and cache write
    /// failures abort the pass.
    pub fn cache_latents_all<B: Backend, E: LatentEncoder<B>>(
        &mut self,
        encoder: &E,
        device: &B::Device,
    ) -> DatasetResult<CachePassReport> {
        let policy = CachePolicy {
            to_disk: self.config.cache_latents_to_disk,
            to_memory: self.config.cache_latents,
        };
        let mut report = CachePassReport {
            total: self.items.len(),
            ..Default::default()
        };
        if !policy.enabled() {
            return Ok(report);
        }
        let version = encoder.latent_space_version().to_string();
        self.set_latent_space_version(&version);
        info!(items = report.total, latent_space = %version, "caching latents");

        for index in 0..self.items.len() {
            let item = &mut self.items[index];
            let path = item.refresh_latent_path()?;
            if policy.to_disk && path.is_file() {
                item.latent.is_cached = true;
                if policy.to_memory {
                    item.get_latent()?;
                }
                report.hits += 1;
                continue;
            }
            if item.latent.is_cached && item.latent.resident.is_some() {
                report.hits += 1;
                continue;
            }

            let mut rng = item_stream(self.seed, index, self.epoch, StreamKind::Augment);
            if let Err(e) = item.load_and_process_image(&mut rng, true) {
                item.cleanup();
                if !e.is_item_recoverable() {
                    return Err(e);
                }
                warn!(path = %item.path.display(), error = %e, "skipping latent for unreadable image");
                report.failed += 1;
                self.skipped_errors += 1;
                continue;
            }
            let pixels = item.tensor.take().ok_or_else(|| DatasetError::MissingTensor {
                path: item.path.clone(),
            })?;
            let pixels = pixels.to_burn::<B>(device).unsqueeze::<4>();
            let latent = encoder.encode(pixels, device, self.encode_dtype)?;
            let latent = LatentTensor::from_burn(latent)?.squeeze_batch();

            if policy.to_disk {
                write_latent(&path, &latent, &item.latent_info())?;
                report.written += 1;
            }
            if policy.to_memory {
                item.latent.resident = Some(latent);
            }
            item.latent.is_cached = true;
            item.cleanup();
            report.encoded += 1;
            debug!(path = %item.path.display(), cache = %path.display(), "latent cached");
        }

        info!(
            hits = report.hits,
            encoded = report.encoded,
            written = report.written,
            failed = report.failed,
            "latent cache pass finished"
        );
        Ok(report)
    }

    /// Load batch `batch` of the current epoch.
    pub fn get_batch<B: Backend>(
        &mut self,
        batch: usize,
        device: &B::Device,
    ) -> DatasetResult<Option<DatasetBatch<B>>> {
        let Some(indices) = self.batch_indices.get(batch).cloned() else {
            return Ok(None);
        };

        let mut loaded = Vec::with_capacity(indices.len());
        let mut skipped = 0;
        for index in indices {
            let mut rng = item_stream(self.seed, index, self.epoch, StreamKind::Augment);
            let item = &mut self.items[index];
            match item.load_and_process_image(&mut rng, false) {
                Ok(()) => loaded.push(index),
                Err(e) if e.is_item_recoverable() => {
                    warn!(path = %item.path.display(), error = %e, "skipping item");
                    item.cleanup();
                    skipped += 1;
                }
                Err(e) => {
                    item.cleanup();
                    for &done in &loaded {
                        self.items[done].cleanup();
                    }
                    return Err(e);
                }
            }
        }
        self.skipped_errors += skipped;

        let batch = self.assemble::<B>(&loaded, skipped, device);
        for &index in &loaded {
            self.items[index].cleanup();
        }
        Ok(Some(batch))
    }

    /// Next batch of the current epoch, or `None` once it is exhausted.
    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<DatasetBatch<B>>> {
        if self.cursor >= self.batch_indices.len() {
            return Ok(None);
        }
        let batch = self.cursor;
        self.cursor += 1;
        self.get_batch(batch, device)
    }

    fn assemble<B: Backend>(
        &self,
        indices: &[usize],
        skipped: usize,
        device: &B::Device,
    ) -> DatasetBatch<B> {
        let items: Vec<&FileItem> = indices.iter().map(|&i| &self.items[i]).collect();
        DatasetBatch {
            indices: indices.to_vec(),
            captions: items.iter().map(|item| item.caption.clone()).collect(),
            poi_in_crop: items
                .iter()
                .map(|item| item.poi.as_ref().and_then(|p| p.in_crop))
                .collect(),
            images: stack_images("images", items.iter().map(|i| i.tensor.as_ref()), device),
            unaugmented_images: stack_images(
                "unaugmented_images",
                items.iter().map(|i| i.unaugmented_tensor.as_ref()),
                device,
            ),
            latents: stack_latents(items.iter().map(|i| i.latent.resident.as_ref()), device),
            control: stack_images(
                "control",
                items
                    .iter()
                    .map(|i| i.control.as_ref().and_then(|c| c.tensor.as_ref())),
                device,
            ),
            mask: stack_images(
                "mask",
                items
                    .iter()
                    .map(|i| i.mask.as_ref().and_then(|m| m.tensor.as_ref())),
                device,
            ),
            clip: stack_images(
                "clip",
                items
                    .iter()
                    .map(|i| i.clip.as_ref().and_then(|c| c.tensor.as_ref())),
                device,
            ),
            unconditional: stack_images(
                "unconditional",
                items
                    .iter()
                    .map(|i| i.unconditional.as_ref().and_then(|c| c.tensor.as_ref())),
                device,
            ),
            skipped,
        }
    }

    pub fn orphaned_cache_files(&self) -> DatasetResult<Vec<PathBuf>> {
        cache::orphaned_files(&self.items)
    }

    pub fn prune_orphaned_cache_files(&self) -> DatasetResult<Vec<PathBuf>> {
        cache::prune_orphans(&self.items)
    }
}

fn stack_images<'a, B: Backend>(
    name: &str,
    tensors: impl Iterator<Item = Option<&'a ImageTensor>>,
    device: &B::Device,
) -> Option<Tensor<B, 4>> {
    let tensors: Vec<&ImageTensor> = tensors.collect::<Option<Vec<_>>>()?;
    let first = tensors.first()?.shape();
    if tensors.iter().any(|t| t.shape() != first) {
        warn!(field = name, "batch tensors differ in shape; omitting field");
        return None;
    }
    let mut buf = Vec::with_capacity(tensors.len() * tensors[0].data.len());
    for t in &tensors {
        buf.extend_from_slice(&t.data);
    }
    let shape = [tensors.len(), first[0], first[1], first[2]];
    Some(Tensor::<B, 1>::from_floats(buf.as_slice(), device).reshape(shape))
}

fn stack_latents<'a, B: Backend>(
    latents: impl Iterator<Item = Option<&'a LatentTensor>>,
    device: &B::Device,
) -> Option<Tensor<B, 4>> {
    let latents: Vec<&LatentTensor> = latents.collect::<Option<Vec<_>>>()?;
    let first = latents.first()?.shape.clone();
    if first.len() != 3 || latents.iter().any(|l| l.shape != first) {
        warn!(shape = ?first, "latents are not uniform [C, H, W]; omitting field");
        return None;
    }
    let mut buf = Vec::with_capacity(latents.len() * latents[0].data.len());
    for l in &latents {
        buf.extend_from_slice(&l.data);
    }
    let shape = [latents.len(), first[0], first[1], first[2]];
    Some(Tensor::<B, 1>::from_floats(buf.as_slice(), device).reshape(shape))
}
