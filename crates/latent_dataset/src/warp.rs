//! Geometric warps implemented as inverse remaps over `RgbImage`.

use crate::aug::{BorderMode, Interpolation};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fill an output image by sampling `img` at `map(x, y)` for every output pixel.
pub fn remap<F>(
    img: &RgbImage,
    out_width: u32,
    out_height: u32,
    interpolation: Interpolation,
    border: BorderMode,
    map: F,
) -> RgbImage
where
    F: Fn(u32, u32) -> (f32, f32),
{
    let mut out = RgbImage::new(out_width, out_height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = map(x, y);
        *pixel = sample(img, sx, sy, interpolation, border);
    }
    out
}

fn sample(img: &RgbImage, x: f32, y: f32, interpolation: Interpolation, border: BorderMode) -> Rgb<u8> {
    match interpolation {
        Interpolation::Nearest => fetch(img, x.round() as i64, y.round() as i64, border),
        _ => bilinear(img, x, y, border),
    }
}

fn bilinear(img: &RgbImage, x: f32, y: f32, border: BorderMode) -> Rgb<u8> {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);
    let taps = [
        (fetch(img, x0, y0, border), (1.0 - fx) * (1.0 - fy)),
        (fetch(img, x0 + 1, y0, border), fx * (1.0 - fy)),
        (fetch(img, x0, y0 + 1, border), (1.0 - fx) * fy),
        (fetch(img, x0 + 1, y0 + 1, border), fx * fy),
    ];
    let mut acc = [0.0f32; 3];
    for (px, weight) in taps {
        for c in 0..3 {
            acc[c] += px[c] as f32 * weight;
        }
    }
    Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
}

fn fetch(img: &RgbImage, x: i64, y: i64, border: BorderMode) -> Rgb<u8> {
    let (w, h) = img.dimensions();
    match (
        resolve_coord(x, w as i64, border),
        resolve_coord(y, h as i64, border),
    ) {
        (Some(x), Some(y)) => *img.get_pixel(x as u32, y as u32),
        _ => Rgb([0, 0, 0]),
    }
}

/// Map an out-of-range coordinate back inside `[0, len)`; `None` means constant fill.
fn resolve_coord(c: i64, len: i64, border: BorderMode) -> Option<i64> {
    if len <= 0 {
        return None;
    }
    if (0..len).contains(&c) {
        return Some(c);
    }
    match border {
        BorderMode::Constant => None,
        BorderMode::Replicate => Some(c.clamp(0, len - 1)),
        BorderMode::Wrap => Some(c.rem_euclid(len)),
        BorderMode::Reflect => {
            // fedcba|abcdef|fedcba
            let period = 2 * len;
            let m = c.rem_euclid(period);
            Some(if m < len { m } else { period - 1 - m })
        }
        BorderMode::Reflect101 => {
            // gfedcb|abcdefgh|gfedcba
            if len == 1 {
                return Some(0);
            }
            let period = 2 * (len - 1);
            let m = c.rem_euclid(period);
            Some(if m < len { m } else { period - m })
        }
    }
}

/// Rotate about the image center; positive angles turn counter-clockwise on screen.
pub fn rotate(img: &RgbImage, angle_deg: f32, interpolation: Interpolation, border: BorderMode) -> RgbImage {
    let (w, h) = img.dimensions();
    let cx = (w as f32 - 1.0) * 0.5;
    let cy = (h as f32 - 1.0) * 0.5;
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    remap(img, w, h, interpolation, border, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        (cos * dx - sin * dy + cx, sin * dx + cos * dy + cy)
    })
}

/// Random per-pixel displacement smoothed by a gaussian of `sigma`, scaled by `alpha`.
/// The field is fully determined by `seed`.
pub fn elastic(
    img: &RgbImage,
    alpha: f32,
    sigma: f32,
    seed: u64,
    interpolation: Interpolation,
    border: BorderMode,
) -> RgbImage {
    let (w, h) = img.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut dx: Vec<f32> = (0..wu * hu).map(|_| rng.random_range(-1.0f32..=1.0)).collect();
    let mut dy: Vec<f32> = (0..wu * hu).map(|_| rng.random_range(-1.0f32..=1.0)).collect();
    smooth_field(&mut dx, wu, hu, sigma);
    smooth_field(&mut dy, wu, hu, sigma);
    remap(img, w, h, interpolation, border, |x, y| {
        let idx = y as usize * wu + x as usize;
        (x as f32 + dx[idx] * alpha, y as f32 + dy[idx] * alpha)
    })
}

/// Separable gaussian smoothing of a scalar field with replicated edges.
fn smooth_field(field: &mut [f32], width: usize, height: usize, sigma: f32) {
    if sigma <= 0.0 || width == 0 || height == 0 {
        return;
    }
    let radius = (sigma * 3.0).ceil().max(1.0) as isize;
    let kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f32 = kernel.iter().sum();
    let mut tmp = vec![0.0f32; field.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = (x as isize + k as isize - radius).clamp(0, width as isize - 1) as usize;
                acc += field[y * width + sx] * weight;
            }
            tmp[y * width + x] = acc / norm;
        }
    }
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = (y as isize + k as isize - radius).clamp(0, height as isize - 1) as usize;
                acc += tmp[sy * width + x] * weight;
            }
            field[y * width + x] = acc / norm;
        }
    }
}

/// Per-axis source coordinates for a grid distortion: the axis is cut into
/// `num_steps` cells and cell `i` is stretched by `steps[i]`. The last cell
/// always ends on the far edge.
fn grid_axis(len: u32, num_steps: u32, steps: &[f32]) -> Vec<f32> {
    let len = len as usize;
    let cell = (len / num_steps.max(1) as usize).max(1);
    let mut coords = Vec::with_capacity(len);
    let mut prev = 0.0f32;
    for (i, start) in (0..len).step_by(cell).enumerate() {
        let end = (start + cell).min(len);
        let n = end - start;
        let next = if end >= len {
            len as f32
        } else {
            prev + n as f32 * steps.get(i).copied().unwrap_or(1.0)
        };
        for j in 0..n {
            let t = j as f32 / n as f32;
            coords.push((prev + (next - prev) * t).min(len as f32 - 1.0));
        }
        prev = next;
    }
    coords
}

pub fn grid_distortion(
    img: &RgbImage,
    num_steps: u32,
    xsteps: &[f32],
    ysteps: &[f32],
    interpolation: Interpolation,
    border: BorderMode,
) -> RgbImage {
    let (w, h) = img.dimensions();
    let map_x = grid_axis(w, num_steps, xsteps);
    let map_y = grid_axis(h, num_steps, ysteps);
    remap(img, w, h, interpolation, border, |x, y| {
        (map_x[x as usize], map_y[y as usize])
    })
}

/// Radial lens distortion with coefficient `k` around a center shifted by `(dx, dy)` pixels.
pub fn optical_distortion(
    img: &RgbImage,
    k: f32,
    dx: f32,
    dy: f32,
    interpolation: Interpolation,
    border: BorderMode,
) -> RgbImage {
    let (w, h) = img.dimensions();
    let fx = w as f32;
    let fy = h as f32;
    let cx = w as f32 * 0.5 + dx;
    let cy = h as f32 * 0.5 + dy;
    remap(img, w, h, interpolation, border, |x, y| {
        let nx = (x as f32 - cx) / fx;
        let ny = (y as f32 - cy) / fy;
        let radial = 1.0 + k * (nx * nx + ny * ny);
        (nx * radial * fx + cx, ny * radial * fy + cy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 7]))
    }

    #[test]
    fn border_modes_resolve_like_opencv() {
        assert_eq!(resolve_coord(-1, 4, BorderMode::Reflect), Some(0));
        assert_eq!(resolve_coord(-1, 4, BorderMode::Reflect101), Some(1));
        assert_eq!(resolve_coord(4, 4, BorderMode::Reflect101), Some(2));
        assert_eq!(resolve_coord(5, 4, BorderMode::Wrap), Some(1));
        assert_eq!(resolve_coord(9, 4, BorderMode::Replicate), Some(3));
        assert_eq!(resolve_coord(-3, 4, BorderMode::Constant), None);
    }

    #[test]
    fn zero_rotation_is_identity() {
        let img = gradient(9, 7);
        let out = rotate(&img, 0.0, Interpolation::Linear, BorderMode::Constant);
        assert_eq!(out, img);
    }

    #[test]
    fn half_turn_rotation_mirrors_both_axes() {
        let img = gradient(5, 5);
        let out = rotate(&img, 180.0, Interpolation::Nearest, BorderMode::Constant);
        assert_eq!(out.get_pixel(0, 0), img.get_pixel(4, 4));
        assert_eq!(out.get_pixel(4, 1), img.get_pixel(0, 3));
    }

    #[test]
    fn unit_grid_is_identity() {
        let img = gradient(10, 10);
        let steps = vec![1.0; 6];
        let out = grid_distortion(&img, 5, &steps, &steps, Interpolation::Linear, BorderMode::Reflect101);
        assert_eq!(out, img);
    }

    #[test]
    fn elastic_is_determined_by_seed() {
        let img = gradient(16, 12);
        let a = elastic(&img, 4.0, 2.0, 99, Interpolation::Linear, BorderMode::Reflect101);
        let b = elastic(&img, 4.0, 2.0, 99, Interpolation::Linear, BorderMode::Reflect101);
        assert_eq!(a, b);
    }
}
