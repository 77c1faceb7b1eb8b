//! Canonical 112x112 face crops for the embedder.
//!
//! With five landmarks the face is warped onto the ArcFace reference points by
//! a least-squares similarity transform. Without landmarks the detected box is
//! squared up and resized.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112x112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// 4-DOF transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Degenerate input (all points coincident) yields the identity.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        // Each pair contributes two rows of A * [a, b, tx, ty]^T = B:
        //   [sx, -sy, 1, 0] -> dx
        //   [sy,  sx, 0, 1] -> dy
        let mut ata = [[0.0f64; 4]; 4];
        let mut atb = [0.0f64; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
            let r1 = [sx, -sy, 1.0, 0.0];
            let r2 = [sy, sx, 0.0, 1.0];
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
                }
                atb[j] += r1[j] * dx + r2[j] * dy;
            }
        }

        match solve_4x4(ata, atb) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self::IDENTITY,
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        let (x, y) = (x as f64, y as f64);
        (
            (self.a * x - self.b * y + self.tx) as f32,
            (self.b * x + self.a * y + self.ty) as f32,
        )
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }

    /// Warp `image` into a `size` x `size` output with bilinear sampling.
    /// Samples outside the source are black.
    pub fn warp(&self, image: &RgbImage, size: u32) -> RgbImage {
        let mut output = RgbImage::new(size, size);
        let Some(inv) = self.inverse() else {
            return output;
        };
        let (w, h) = (image.width() as i64, image.height() as i64);

        let sample = |x: i64, y: i64| -> [f64; 3] {
            if x >= 0 && x < w && y >= 0 && y < h {
                let p = image.get_pixel(x as u32, y as u32).0;
                [p[0] as f64, p[1] as f64, p[2] as f64]
            } else {
                [0.0; 3]
            }
        };

        for (ox, oy, px) in output.enumerate_pixels_mut() {
            let (sx, sy) = inv.apply((ox as f32, oy as f32));
            let (sx, sy) = (sx as f64, sy as f64);
            let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
            let (fx, fy) = (sx - x0 as f64, sy - y0 as f64);

            let tl = sample(x0, y0);
            let tr = sample(x0 + 1, y0);
            let bl = sample(x0, y0 + 1);
            let br = sample(x0 + 1, y0 + 1);

            let mut rgb = [0u8; 3];
            for c in 0..3 {
                let v = tl[c] * (1.0 - fx) * (1.0 - fy)
                    + tr[c] * fx * (1.0 - fy)
                    + bl[c] * (1.0 - fx) * fy
                    + br[c] * fx * fy;
                rgb[c] = v.round().clamp(0.0, 255.0) as u8;
            }
            *px = Rgb(rgb);
        }

        output
    }
}

/// Gaussian elimination with partial pivoting. `None` when singular.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(mut a: [[f64; 4]; 4], mut b: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        let pivot = a[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = a[row][col] / pivot;
            for k in col..4 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = ((i + 1)..4).map(|j| a[i][j] * x[j]).sum();
        x[i] = (b[i] - tail) / a[i][i];
    }
    Some(x)
}

/// Warp the face described by `landmarks` onto the reference layout.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112).warp(image, ALIGNED_SIZE)
}

/// Square crop centred on `region`, resized to 112x112. Used when the
/// detector supplied no landmarks.
pub fn crop_face(image: &RgbImage, region: &FaceRegion) -> RgbImage {
    let side = region.width().max(region.height()).max(1);
    let cx = (region.left + region.right) / 2;
    let cy = (region.top + region.bottom) / 2;
    let left = cx.saturating_sub(side / 2).min(image.width().saturating_sub(1));
    let top = cy.saturating_sub(side / 2).min(image.height().saturating_sub(1));
    let w = side.min(image.width() - left).max(1);
    let h = side.min(image.height() - top).max(1);

    let crop = imageops::crop_imm(image, left, top, w, h).to_image();
    imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
}
