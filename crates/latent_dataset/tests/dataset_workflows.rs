//! End-to-end workflows: indexing, bucketing, companion replay and the latent cache.

use burn::tensor::module::avg_pool2d;
use burn::tensor::{backend::Backend, DType, Tensor};
use burn_ndarray::NdArray;
use data_contracts::PixelRect;
use image::{imageops, Rgb, RgbImage};
use latent_dataset::processing::{load_oriented, scale_and_crop};
use latent_dataset::rng::{item_stream, StreamKind};
use latent_dataset::{
    bucket_for_image_size, read_latent, write_latent, AugmentSpec, DatasetConfig, DatasetError,
    DatasetResult, Geometry, LatentDataset, LatentEncoder, LatentTensor, SpatialStep,
    DEFAULT_LATENT_SPACE_VERSION, LATENT_CACHE_DIR,
};
use std::fs;
use std::path::{Path, PathBuf};

type TestBackend = NdArray<f32>;

/// Average-pools by 8 and pads to four channels, like a small VAE.
struct PoolEncoder;

impl<B: Backend> LatentEncoder<B> for PoolEncoder {
    fn encode(
        &self,
        pixels: Tensor<B, 4>,
        _device: &B::Device,
        _dtype: DType,
    ) -> DatasetResult<Tensor<B, 4>> {
        let pooled = avg_pool2d(pixels, [8, 8], [8, 8], [0, 0], true);
        let extra = pooled.clone().narrow(1, 0, 1);
        Ok(Tensor::cat(vec![pooled, extra], 1))
    }

    fn decode(&self, latents: Tensor<B, 4>) -> DatasetResult<Tensor<B, 4>> {
        let [n, _, h, w] = latents.dims();
        let rgb = latents.slice([0..n, 0..3, 0..h, 0..w]);
        Ok(rgb.repeat_dim(2, 8).repeat_dim(3, 8))
    }

    fn latent_space_version(&self) -> &str {
        "pool8"
    }
}

fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
    })
}

fn write_image(dir: &Path, name: &str, img: &RgbImage) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    img.save(&path)?;
    Ok(path)
}

fn small_config(dir: &Path) -> DatasetConfig {
    DatasetConfig {
        folder_path: dir.to_path_buf(),
        resolution: 64,
        bucket_tolerance: 16,
        batch_size: 2,
        seed: Some(11),
        ..Default::default()
    }
}

#[test]
fn hundred_mixed_orientation_images_form_two_buckets() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let landscape = RgbImage::from_pixel(1600, 1200, Rgb([90, 120, 150]));
    let portrait = RgbImage::from_pixel(1200, 1600, Rgb([150, 120, 90]));
    for i in 0..30 {
        write_image(dir.path(), &format!("land_{i:03}.png"), &landscape)?;
    }
    for i in 0..70 {
        write_image(dir.path(), &format!("port_{i:03}.png"), &portrait)?;
    }

    let config = DatasetConfig {
        folder_path: dir.path().to_path_buf(),
        resolution: 512,
        bucket_tolerance: 64,
        seed: Some(3),
        ..Default::default()
    };
    let dataset = LatentDataset::new(config)?;
    assert_eq!(dataset.len(), 100);
    assert_eq!(dataset.buckets().len(), 2);

    for bucket in dataset.buckets().iter() {
        assert_eq!(bucket.width % 64, 0);
        assert_eq!(bucket.height % 64, 0);
        let expected = if bucket.width > bucket.height { 30 } else { 70 };
        assert_eq!(bucket.indices.len(), expected, "bucket {}", bucket.key());
        for &index in &bucket.indices {
            let g = dataset.items()[index].geometry;
            assert!(g.is_consistent());
            assert_eq!((g.crop_width, g.crop_height), (bucket.width, bucket.height));
        }
    }
    Ok(())
}

#[test]
fn crop_window_fits_the_scaled_image() {
    let geometry = Geometry {
        scale_to_width: 600,
        scale_to_height: 512,
        crop_x: 50,
        crop_y: 0,
        crop_width: 512,
        crop_height: 512,
    };
    assert!(geometry.is_consistent());
    assert!(geometry.crop_x + geometry.crop_width <= geometry.scale_to_width);

    let overshoot = Geometry {
        crop_x: 89,
        ..geometry
    };
    assert!(!overshoot.is_consistent());
}

#[test]
fn cache_key_depends_on_flip_and_is_stable() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "cat.png", &gradient(520, 520))?;
    let config = DatasetConfig {
        folder_path: dir.path().to_path_buf(),
        flip_x: true,
        seed: Some(5),
        ..Default::default()
    };

    let fixed = Geometry {
        scale_to_width: 520,
        scale_to_height: 520,
        crop_x: 4,
        crop_y: 4,
        crop_width: 512,
        crop_height: 512,
    };
    let mut paths = Vec::new();
    for _ in 0..2 {
        let mut dataset = LatentDataset::new(config.clone())?;
        dataset.set_latent_space_version("sd1");
        let items = dataset.items_mut();
        assert_eq!(items.len(), 2);
        let mut run = Vec::new();
        for item in items.iter_mut() {
            item.geometry = fixed;
            assert_eq!(item.latent.version, 1);
            run.push(item.refresh_latent_path()?);
        }
        paths.push(run);
    }

    let (plain, flipped) = (&paths[0][0], &paths[0][1]);
    assert_eq!(paths[0], paths[1]);
    assert_ne!(plain, flipped);
    let name = plain.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(name.starts_with("cat_"));
    assert!(name.ends_with(".safetensors"));
    assert_eq!(plain.parent(), Some(dir.path().join(LATENT_CACHE_DIR).as_path()));
    Ok(())
}

#[test]
fn companion_replay_differs_from_primary_only_by_flip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let control_dir = dir.path().join("control");
    let img = gradient(64, 48);
    write_image(dir.path(), "pair.png", &img)?;
    let control_path = write_image(&control_dir, "pair.png", &img)?;

    let mut config = small_config(dir.path());
    config.control_path = Some(control_dir.clone());
    config.augmentations = vec![
        AugmentSpec::new("ColorJitter")
            .with_param("p", 1.0)
            .with_param("brightness", 0.5)
            .with_param("contrast", 0.5),
        AugmentSpec::new("HorizontalFlip").with_param("p", 1.0),
    ];

    let mut dataset = LatentDataset::new(config)?;
    let item = &mut dataset.items_mut()[0];
    let mut rng = item_stream(11, 0, 0, StreamKind::Augment);
    item.load_and_process_image(&mut rng, false)?;

    let record = item.replay.clone().expect("replay recorded");
    assert_eq!(record.steps().len(), 1);
    assert!(matches!(record.steps()[0], SpatialStep::Flip { .. }));

    let base = scale_and_crop(&load_oriented(&control_path)?.to_rgb8(), &item.geometry, &control_path);
    let expected = latent_dataset::ImageTensor::from_rgb(&imageops::flip_horizontal(&base));
    let control = item
        .control
        .as_ref()
        .and_then(|c| c.tensor.clone())
        .expect("control loaded");
    assert_eq!(control, expected);

    // Replaying the same record is idempotent.
    assert_eq!(record.replay(&base), record.replay(&base));
    Ok(())
}

#[test]
fn region_of_interest_stays_inside_crop_for_both_flips() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "face.png", &gradient(1000, 800))?;
    let region = PixelRect::new(300, 200, 120, 100);
    fs::write(
        dir.path().join("face.json"),
        r#"{"caption": "a face", "poi": {"face": {"x": 300, "y": 200, "width": 120, "height": 100}}}"#,
    )?;

    for seed in 0..20 {
        let config = DatasetConfig {
            folder_path: dir.path().to_path_buf(),
            resolution: 512,
            bucket_tolerance: 64,
            caption_ext: "json".into(),
            poi: Some("face".into()),
            flip_x: true,
            flip_y: true,
            seed: Some(seed),
            ..Default::default()
        };
        let dataset = LatentDataset::new(config)?;
        for item in dataset.items() {
            assert_eq!(item.caption, "a face");
            let g = item.geometry;
            assert!(g.is_consistent(), "seed {seed}: {g:?}");

            let in_crop = item.poi.as_ref().and_then(|p| p.in_crop).expect("poi placed");
            let crop = PixelRect::new(0, 0, g.crop_width, g.crop_height);
            assert!(crop.contains(&in_crop), "seed {seed}: {in_crop:?} outside {crop:?}");

            let mut oriented = region;
            if item.flip_x {
                oriented = oriented.mirrored_x(item.width);
            }
            if item.flip_y {
                oriented = oriented.mirrored_y(item.height);
            }
            assert_eq!(item.oriented_poi(), Some(oriented));
            let factor_x = g.scale_to_width as f64 / item.width as f64;
            let expected_x = oriented.x as f64 * factor_x - g.crop_x as f64;
            assert!(
                (in_crop.x as f64 - expected_x).abs() <= 2.0,
                "seed {seed}: {} vs {expected_x}",
                in_crop.x
            );
            let factor_y = g.scale_to_height as f64 / item.height as f64;
            let expected_y = oriented.y as f64 * factor_y - g.crop_y as f64;
            assert!(
                (in_crop.y as f64 - expected_y).abs() <= 2.0,
                "seed {seed}: {} vs {expected_y}",
                in_crop.y
            );
        }
        let flips: Vec<_> = dataset.items().iter().map(|i| (i.flip_x, i.flip_y)).collect();
        assert_eq!(flips, vec![(false, false), (true, false), (false, true)]);
    }
    Ok(())
}

#[test]
fn unplaceable_region_falls_back_to_standard_bucketing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "strip.png", &RgbImage::from_pixel(2000, 300, Rgb([40, 80, 120])))?;
    // spans the full width, so no 4:1 crop can hold it at this resolution
    fs::write(
        dir.path().join("strip.json"),
        r#"{"caption": "a strip", "poi": {"strip": {"x": 0, "y": 140, "width": 2000, "height": 20}}}"#,
    )?;
    let config = DatasetConfig {
        folder_path: dir.path().to_path_buf(),
        resolution: 512,
        bucket_tolerance: 64,
        caption_ext: "json".into(),
        poi: Some("strip".into()),
        seed: Some(4),
        ..Default::default()
    };

    let dataset = LatentDataset::new(config)?;
    let item = &dataset.items()[0];
    assert_eq!(item.poi.as_ref().map(|p| p.in_crop), Some(None));
    let bucket = bucket_for_image_size(2000, 300, 512, 64);
    let g = item.geometry;
    assert!(g.is_consistent());
    assert_eq!((g.crop_width, g.crop_height), (bucket.width, bucket.height));
    assert_eq!(dataset.buckets().len(), 1);
    Ok(())
}

#[test]
fn disk_cache_is_written_then_reused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "a.png", &gradient(64, 48))?;
    write_image(dir.path(), "b.png", &gradient(64, 48))?;
    let mut config = small_config(dir.path());
    config.cache_latents_to_disk = true;
    let device = Default::default();

    let mut dataset = LatentDataset::new(config.clone())?;
    let report = dataset.cache_latents_all::<TestBackend, _>(&PoolEncoder, &device)?;
    assert_eq!((report.total, report.encoded, report.written, report.hits), (2, 2, 2, 0));

    for item in dataset.items() {
        let path = item.latent.path.clone().expect("cache path");
        let (latent, info) = read_latent(&path)?;
        assert_eq!(latent.shape, vec![4, 6, 8]);
        assert_eq!(info, Some(item.latent_info()));
        assert!(item.latent.resident.is_none());
    }

    let mut again = LatentDataset::new(config)?;
    let report = again.cache_latents_all::<TestBackend, _>(&PoolEncoder, &device)?;
    assert_eq!((report.hits, report.encoded), (2, 0));

    let batch = again.next_batch::<TestBackend>(&device)?.expect("one batch");
    assert!(batch.images.is_none());
    let latents = batch.latents.expect("latents stacked");
    assert_eq!(latents.dims(), [2, 4, 6, 8]);

    let decoded = LatentEncoder::<TestBackend>::decode(&PoolEncoder, latents)?;
    assert_eq!(decoded.dims(), [2, 3, 48, 64]);
    assert!(again.next_batch::<TestBackend>(&device)?.is_none());
    Ok(())
}

#[test]
fn memory_cache_keeps_latents_resident() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "a.png", &gradient(64, 48))?;
    let mut config = small_config(dir.path());
    config.cache_latents = true;
    let device = Default::default();

    let mut dataset = LatentDataset::new(config)?;
    let report = dataset.cache_latents_all::<TestBackend, _>(&PoolEncoder, &device)?;
    assert_eq!((report.encoded, report.written), (1, 0));
    assert!(!dir.path().join(LATENT_CACHE_DIR).exists());

    let batch = dataset.next_batch::<TestBackend>(&device)?.expect("batch");
    assert_eq!(batch.latents.map(|l| l.dims()), Some([1, 4, 6, 8]));
    assert!(dataset.items()[0].latent.resident.is_some());
    Ok(())
}

#[test]
fn cache_write_failure_aborts_the_pass() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "a.png", &gradient(64, 48))?;
    fs::write(dir.path().join(LATENT_CACHE_DIR), b"not a directory")?;
    let mut config = small_config(dir.path());
    config.cache_latents_to_disk = true;

    let mut dataset = LatentDataset::new(config)?;
    let result = dataset.cache_latents_all::<TestBackend, _>(&PoolEncoder, &Default::default());
    assert!(matches!(result, Err(DatasetError::Io { .. })));
    Ok(())
}

#[test]
fn orphaned_cache_files_are_listed_and_pruned() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "a.png", &gradient(64, 48))?;
    let mut config = small_config(dir.path());
    config.cache_latents_to_disk = true;
    let device = Default::default();

    let mut dataset = LatentDataset::new(config)?;
    dataset.cache_latents_all::<TestBackend, _>(&PoolEncoder, &device)?;
    let live = dataset.items()[0].latent.path.clone().expect("cache path");
    let stale = dir.path().join(LATENT_CACHE_DIR).join("a_stalehash.safetensors");
    fs::copy(&live, &stale)?;

    assert_eq!(dataset.orphaned_cache_files()?, vec![stale.clone()]);
    assert!(stale.exists());
    assert_eq!(dataset.prune_orphaned_cache_files()?, vec![stale.clone()]);
    assert!(!stale.exists());
    assert!(live.exists());
    Ok(())
}

#[test]
fn fresh_dataset_keeps_default_space_cache_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "a.png", &gradient(64, 48))?;
    let config = small_config(dir.path());

    let mut first = LatentDataset::new(config.clone())?;
    assert_eq!(first.items()[0].latent.space_version, DEFAULT_LATENT_SPACE_VERSION);
    let item = &mut first.items_mut()[0];
    let live = item.refresh_latent_path()?;
    let latent = LatentTensor::new(vec![4, 6, 8], vec![0.25; 4 * 6 * 8])?;
    write_latent(&live, &latent, &item.latent_info())?;

    let fresh = LatentDataset::new(config)?;
    assert!(fresh.orphaned_cache_files()?.is_empty());
    assert!(fresh.prune_orphaned_cache_files()?.is_empty());
    assert!(live.exists());
    Ok(())
}

#[test]
fn pruning_refuses_items_without_a_latent_space() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_image(dir.path(), "a.png", &gradient(64, 48))?;
    let mut dataset = LatentDataset::new(small_config(dir.path()))?;
    let live = dataset.items_mut()[0].refresh_latent_path()?;
    let latent = LatentTensor::new(vec![4, 6, 8], vec![0.5; 4 * 6 * 8])?;
    write_latent(&live, &latent, &dataset.items()[0].latent_info())?;

    dataset.set_latent_space_version("");
    assert!(matches!(
        dataset.prune_orphaned_cache_files(),
        Err(DatasetError::Config(_))
    ));
    assert!(live.exists());
    Ok(())
}
