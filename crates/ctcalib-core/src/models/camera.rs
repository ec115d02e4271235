use image::{DynamicImage, ImageBuffer, Pixel};
use serde::{Deserialize, Serialize};

use crate::math::{Mat3, Real, Vec2, Vec3};

/// Brown-Conrady distortion with three radial and two tangential terms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrownConrady5 {
    pub k1: Real,
    pub k2: Real,
    pub k3: Real,
    pub p1: Real,
    pub p2: Real,
}

impl BrownConrady5 {
    pub fn is_identity(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.k3 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0
    }

    /// Apply distortion to a normalized image point.
    pub fn distort(&self, n: &Vec2) -> Vec2 {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;

        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        Vec2::new(x * radial + x_tan, y * radial + y_tan)
    }

    /// Remove distortion from a normalized image point by fixed-point
    /// iteration.
    pub fn undistort(&self, n_dist: &Vec2) -> Vec2 {
        let mut n = *n_dist;
        for _ in 0..10 {
            let err = self.distort(&n) - n_dist;
            n -= err;
        }
        n
    }
}

/// Pinhole camera with Brown-Conrady distortion.
///
/// Field order keeps plain values ahead of the nested distortion table so
/// the struct also serializes to TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeIntrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: Real,
    pub fy: Real,
    pub cx: Real,
    pub cy: Real,
    #[serde(default)]
    pub dist: BrownConrady5,
}

impl PinholeIntrinsics {
    pub fn k_matrix(&self) -> Mat3 {
        Mat3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn normalized_to_pixel(&self, n: &Vec2) -> Vec2 {
        Vec2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy)
    }

    pub fn pixel_to_normalized(&self, px: &Vec2) -> Vec2 {
        Vec2::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy)
    }

    /// Project a point in the camera frame with the undistorted pinhole model.
    /// Points on or behind the image plane have no projection.
    pub fn project_undistorted(&self, p_cam: &Vec3) -> Option<Vec2> {
        if p_cam.z <= 1e-9 {
            return None;
        }
        Some(self.normalized_to_pixel(&Vec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z)))
    }

    /// Source pixel in the distorted image for a pixel of the undistorted one.
    pub fn distorted_pixel_of(&self, undistorted_px: &Vec2) -> Vec2 {
        let n = self.pixel_to_normalized(undistorted_px);
        self.normalized_to_pixel(&self.dist.distort(&n))
    }

    /// Remap `img` into the ideal pinhole image with the same intrinsics and
    /// size. Pixels mapping outside the source image are left black.
    pub fn undistort_image(&self, img: &DynamicImage) -> DynamicImage {
        if self.dist.is_identity() {
            return img.clone();
        }
        let map = |u: f64, v: f64| {
            let d = self.distorted_pixel_of(&Vec2::new(u, v));
            (d.x, d.y)
        };
        match img {
            DynamicImage::ImageLuma8(gray) => DynamicImage::ImageLuma8(remap_bilinear(gray, map)),
            other => DynamicImage::ImageRgb8(remap_bilinear(&other.to_rgb8(), map)),
        }
    }
}

fn remap_bilinear<P>(
    src: &ImageBuffer<P, Vec<u8>>,
    map: impl Fn(f64, f64) -> (f64, f64),
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = src.dimensions();
    let mut out = ImageBuffer::<P, Vec<u8>>::new(w, h);
    if w == 0 || h == 0 {
        return out;
    }
    let (max_x, max_y) = ((w - 1) as f64, (h - 1) as f64);
    let channels = P::CHANNEL_COUNT as usize;

    for (x, y, px) in out.enumerate_pixels_mut() {
        let (sx, sy) = map(x as f64, y as f64);
        if !(0.0..=max_x).contains(&sx) || !(0.0..=max_y).contains(&sy) {
            continue;
        }
        let (x0, y0) = (sx.floor() as u32, sy.floor() as u32);
        let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
        let (ax, ay) = (sx - x0 as f64, sy - y0 as f64);

        let p00 = src.get_pixel(x0, y0).channels();
        let p10 = src.get_pixel(x1, y0).channels();
        let p01 = src.get_pixel(x0, y1).channels();
        let p11 = src.get_pixel(x1, y1).channels();
        let dst = px.channels_mut();
        for c in 0..channels {
            let v = p00[c] as f64 * (1.0 - ax) * (1.0 - ay)
                + p10[c] as f64 * ax * (1.0 - ay)
                + p01[c] as f64 * (1.0 - ax) * ay
                + p11[c] as f64 * ax * ay;
            dst[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
