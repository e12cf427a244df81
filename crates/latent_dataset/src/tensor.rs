//! Host-side tensors and their conversion to burn tensors.

use crate::types::{DatasetError, DatasetResult};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{GrayImage, RgbImage};

/// Planar CHW image tensor with `f32` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImageTensor {
    /// RGB image to CHW in `[0, 1]`.
    pub fn from_rgb(img: &RgbImage) -> Self {
        let (w, h) = img.dimensions();
        let (w, h) = (w as usize, h as usize);
        let plane = w * h;
        let mut data = vec![0.0f32; plane * 3];
        for (x, y, pixel) in img.enumerate_pixels() {
            let idx = y as usize * w + x as usize;
            for c in 0..3 {
                data[c * plane + idx] = pixel[c] as f32 / 255.0;
            }
        }
        Self {
            channels: 3,
            height: h,
            width: w,
            data,
        }
    }

    /// Single-channel image to `1xHxW` in `[0, 1]`.
    pub fn from_luma(img: &GrayImage) -> Self {
        let (w, h) = img.dimensions();
        Self {
            channels: 1,
            height: h as usize,
            width: w as usize,
            data: img.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    /// Map `[0, 1]` samples to `[-1, 1]`.
    pub fn into_signed(self) -> Self {
        self.value_map((0.0, 1.0), (-1.0, 1.0))
    }

    /// Affine remap of every sample from `from` onto `to`.
    pub fn value_map(mut self, from: (f32, f32), to: (f32, f32)) -> Self {
        let span = from.1 - from.0;
        if span == 0.0 {
            return self;
        }
        let ratio = (to.1 - to.0) / span;
        for v in self.data.iter_mut() {
            *v = (*v - from.0) * ratio + to.0;
        }
        self
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    pub fn to_burn<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        let data = TensorData::new(self.data.clone(), self.shape().to_vec());
        Tensor::<B, 3>::from_data(data, device)
    }
}

/// Dense latent tensor in row-major order, detached from any backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl LatentTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> DatasetResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DatasetError::Tensor(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn from_burn<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> DatasetResult<Self> {
        let shape = tensor.dims().to_vec();
        let data = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| DatasetError::Tensor(format!("{e:?}")))?;
        Self::new(shape, data)
    }

    pub fn to_burn<B: Backend, const D: usize>(
        &self,
        device: &B::Device,
    ) -> DatasetResult<Tensor<B, D>> {
        if self.shape.len() != D {
            return Err(DatasetError::Tensor(format!(
                "latent has rank {}, requested rank {}",
                self.shape.len(),
                D
            )));
        }
        let data = TensorData::new(self.data.clone(), self.shape.clone());
        Ok(Tensor::<B, D>::from_data(data, device))
    }

    /// Latents are stored per item; drop a leading batch axis of one if present.
    pub fn squeeze_batch(mut self) -> Self {
        if self.shape.len() == 4 && self.shape[0] == 1 {
            self.shape.remove(0);
        }
        self
    }
}
