//! Image loading and per-item pixel processing.

use crate::item::{FileItem, Geometry, MaskSource};
use crate::tensor::ImageTensor;
use crate::types::{DatasetError, DatasetResult};
use image::imageops::{self, FilterType};
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, Rgb, RgbImage};
use rand::{Rng, RngCore};
use std::path::Path;
use tracing::warn;

/// Raster extensions, in probe order.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Edge length full-size control images are resized to.
pub const FULL_SIZE_CONTROL: u32 = 512;

/// Mask blur radius is drawn up to this fraction of the shorter side.
const MASK_BLUR_FRACTION: f32 = 0.005;

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn swaps_axes(orientation: Orientation) -> bool {
    matches!(
        orientation,
        Orientation::Rotate90
            | Orientation::Rotate270
            | Orientation::Rotate90FlipH
            | Orientation::Rotate270FlipH
    )
}

/// Decode with EXIF orientation applied.
pub fn load_oriented(path: &Path) -> DatasetResult<DynamicImage> {
    let reader = ImageReader::open(path)
        .map_err(|e| DatasetError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| DatasetError::io(path, e))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| DatasetError::image(path, e))?;
    let orientation = decoder
        .orientation()
        .map_err(|e| DatasetError::image(path, e))?;
    let mut img = DynamicImage::from_decoder(decoder).map_err(|e| DatasetError::image(path, e))?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Size after EXIF orientation, read from the header only.
pub fn oriented_dimensions(path: &Path) -> DatasetResult<(u32, u32)> {
    let reader = ImageReader::open(path)
        .map_err(|e| DatasetError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| DatasetError::io(path, e))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| DatasetError::image(path, e))?;
    let (w, h) = decoder.dimensions();
    let orientation = decoder
        .orientation()
        .map_err(|e| DatasetError::image(path, e))?;
    Ok(if swaps_axes(orientation) { (h, w) } else { (w, h) })
}

/// A landscape image must not land in a portrait scale target and vice versa.
pub fn check_orientation(path: &Path, width: u32, height: u32, g: &Geometry) -> DatasetResult<()> {
    let mismatched = (width > height && g.scale_to_width < g.scale_to_height)
        || (height > width && g.scale_to_height < g.scale_to_width);
    if mismatched {
        return Err(DatasetError::OrientationMismatch {
            path: path.to_path_buf(),
            width,
            height,
            scale_to_width: g.scale_to_width,
            scale_to_height: g.scale_to_height,
        });
    }
    Ok(())
}

pub fn apply_flips(mut img: RgbImage, flip_x: bool, flip_y: bool) -> RgbImage {
    if flip_x {
        imageops::flip_horizontal_in_place(&mut img);
    }
    if flip_y {
        imageops::flip_vertical_in_place(&mut img);
    }
    img
}

/// Resize to `scale_to_*` and cut the crop window. Any part of the window
/// outside the scaled image stays black so the output is always crop-sized.
pub fn scale_and_crop(img: &RgbImage, g: &Geometry, path: &Path) -> RgbImage {
    let resized = imageops::resize(img, g.scale_to_width, g.scale_to_height, FilterType::CatmullRom);
    if !g.is_consistent() {
        warn!(path = %path.display(), geometry = ?g, "size mismatch: padding crop");
    }
    let mut canvas = RgbImage::new(g.crop_width, g.crop_height);
    imageops::replace(&mut canvas, &resized, -(g.crop_x as i64), -(g.crop_y as i64));
    canvas
}

/// Alpha channel replicated over RGB; opaque white when there is no alpha.
pub fn alpha_as_rgb(img: &DynamicImage) -> RgbImage {
    let (w, h) = (img.width(), img.height());
    if !img.color().has_alpha() {
        return RgbImage::from_pixel(w, h, Rgb([255, 255, 255]));
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(w, h, |x, y| {
        let a = rgba.get_pixel(x, y)[3];
        Rgb([a, a, a])
    })
}

impl FileItem {
    fn replay_spatial(&self, img: RgbImage) -> RgbImage {
        match &self.replay {
            Some(record) if !record.is_empty() => record.replay(&img),
            _ => img,
        }
    }

    /// Load the primary image (or its cached latent) and every companion.
    ///
    /// With `only_latents` the image is prepared for encoding: no augmentation
    /// and no companions.
    pub fn load_and_process_image(
        &mut self,
        rng: &mut dyn RngCore,
        only_latents: bool,
    ) -> DatasetResult<()> {
        if self.latent.is_cached {
            self.get_latent()?;
            if !only_latents {
                self.load_companions(rng)?;
            }
            return Ok(());
        }

        let img = load_oriented(&self.path)?.to_rgb8();
        let (w, h) = img.dimensions();
        check_orientation(&self.path, w, h, &self.geometry)?;
        let img = apply_flips(img, self.flip_x, self.flip_y);
        let img = scale_and_crop(&img, &self.geometry, &self.path);

        match self.augment.as_mut() {
            Some(pipeline) if !only_latents => {
                pipeline.recompose(rng);
                self.unaugmented_tensor = Some(ImageTensor::from_rgb(&img).into_signed());
                let (augmented, trace) = pipeline.apply(img, rng);
                self.replay = Some(trace.replay_record());
                self.tensor = Some(ImageTensor::from_rgb(&augmented).into_signed());
            }
            _ => self.tensor = Some(ImageTensor::from_rgb(&img).into_signed()),
        }

        if !only_latents {
            self.load_companions(rng)?;
        }
        Ok(())
    }

    pub fn load_companions(&mut self, rng: &mut dyn RngCore) -> DatasetResult<()> {
        self.load_control_image()?;
        self.load_clip_image(rng)?;
        self.load_mask_image(rng)?;
        self.load_unconditional_image()?;
        Ok(())
    }

    /// Same geometry as the primary, then the primary's spatial replay. `[0, 1]`.
    pub fn load_control_image(&mut self) -> DatasetResult<()> {
        let Some(path) = self.control.as_ref().map(|c| c.path.clone()) else {
            return Ok(());
        };
        let img = load_oriented(&path)?.to_rgb8();
        let img = if self.config.full_size_control_images {
            imageops::resize(&img, FULL_SIZE_CONTROL, FULL_SIZE_CONTROL, FilterType::CatmullRom)
        } else {
            let (w, h) = img.dimensions();
            check_orientation(&path, w, h, &self.geometry)?;
            let img = apply_flips(img, self.flip_x, self.flip_y);
            scale_and_crop(&img, &self.geometry, &path)
        };
        let img = self.replay_spatial(img);
        if let Some(control) = self.control.as_mut() {
            control.tensor = Some(ImageTensor::from_rgb(&img));
        }
        Ok(())
    }

    /// Flipped like the item, augmented with its own pipeline, never bucket-cropped.
    pub fn load_clip_image(&mut self, rng: &mut dyn RngCore) -> DatasetResult<()> {
        let Some(path) = self.clip.as_ref().map(|c| c.path.clone()) else {
            return Ok(());
        };
        let img = apply_flips(load_oriented(&path)?.to_rgb8(), self.flip_x, self.flip_y);
        let img = match self.clip_augment.as_mut() {
            Some(pipeline) => {
                pipeline.recompose(rng);
                pipeline.apply(img, rng).0
            }
            None => img,
        };
        let img = match self.config.clip_image_size {
            Some(size) => imageops::resize(&img, size, size, FilterType::CatmullRom),
            None => img,
        };
        if let Some(clip) = self.clip.as_mut() {
            clip.tensor = Some(ImageTensor::from_rgb(&img));
        }
        Ok(())
    }

    /// One-channel mask in `[mask_min_value, 1]`.
    pub fn load_mask_image(&mut self, rng: &mut dyn RngCore) -> DatasetResult<()> {
        let Some(source) = self.mask.as_ref().map(|m| m.source.clone()) else {
            return Ok(());
        };
        let (path, mut img) = match source {
            MaskSource::File(path) => {
                let img = load_oriented(&path)?.to_rgb8();
                (path, img)
            }
            MaskSource::Alpha => (self.path.clone(), alpha_as_rgb(&load_oriented(&self.path)?)),
        };
        if self.config.invert_mask {
            imageops::invert(&mut img);
        }
        let (w, h) = img.dimensions();
        if let Err(e) = check_orientation(&path, w, h, &self.geometry) {
            warn!(error = %e, "mask orientation differs from its bucket");
        }
        let img = apply_flips(img, self.flip_x, self.flip_y);
        let radius = (w.min(h) as f32 * rng.random::<f32>() * MASK_BLUR_FRACTION) as u32;
        let img = if radius > 0 {
            imageops::blur(&img, radius as f32)
        } else {
            img
        };
        let img = scale_and_crop(&img, &self.geometry, &path);
        let img = self.replay_spatial(img);
        let gray = DynamicImage::ImageRgb8(img).to_luma8();
        let tensor = ImageTensor::from_luma(&gray)
            .value_map((0.0, 1.0), (self.config.mask_min_value, 1.0));
        if let Some(mask) = self.mask.as_mut() {
            mask.tensor = Some(tensor);
        }
        Ok(())
    }

    /// Same geometry and replay as the primary, signed range.
    pub fn load_unconditional_image(&mut self) -> DatasetResult<()> {
        let Some(path) = self.unconditional.as_ref().map(|c| c.path.clone()) else {
            return Ok(());
        };
        let img = load_oriented(&path)?.to_rgb8();
        let (w, h) = img.dimensions();
        check_orientation(&path, w, h, &self.geometry)?;
        let img = apply_flips(img, self.flip_x, self.flip_y);
        let img = scale_and_crop(&img, &self.geometry, &path);
        let img = self.replay_spatial(img);
        if let Some(unconditional) = self.unconditional.as_mut() {
            unconditional.tensor = Some(ImageTensor::from_rgb(&img).into_signed());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_check() {
        let landscape = Geometry {
            scale_to_width: 600,
            scale_to_height: 512,
            crop_width: 512,
            crop_height: 512,
            ..Default::default()
        };
        let p = Path::new("x.png");
        assert!(check_orientation(p, 800, 600, &landscape).is_ok());
        assert!(check_orientation(p, 600, 600, &landscape).is_ok());
        assert!(matches!(
            check_orientation(p, 600, 800, &landscape),
            Err(DatasetError::OrientationMismatch { .. })
        ));
    }

    #[test]
    fn crop_is_always_crop_sized() {
        let img = RgbImage::from_pixel(40, 30, Rgb([9, 9, 9]));
        let g = Geometry {
            scale_to_width: 40,
            scale_to_height: 30,
            crop_x: 20,
            crop_y: 0,
            crop_width: 32,
            crop_height: 32,
        };
        let out = scale_and_crop(&img, &g, Path::new("x.png"));
        assert_eq!(out.dimensions(), (32, 32));
        assert_eq!(out.get_pixel(0, 0), &Rgb([9, 9, 9]));
        assert_eq!(out.get_pixel(31, 31), &Rgb([0, 0, 0]));
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        assert!(is_image_file(Path::new("a/B.PNG")));
        assert!(is_image_file(Path::new("c.webp")));
        assert!(!is_image_file(Path::new("c.txt")));
    }
}
