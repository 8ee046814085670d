//! 円形マーカー検出
//!
//! 学習・収集パイプラインは [`CircleDetector`] トレイト越しに検出器を使います。
//! [`HoughCircleDetector`] は Canny エッジ + 勾配方向ハフ投票による標準実装です。

use image::GrayImage;
use imageproc::edges::canny;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

/// 検出された円 (中心X, 中心Y, 半径)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerDetection {
    pub center_x: f32,
    pub center_y: f32,
    pub radius: f32,
}

impl MarkerDetection {
    pub fn new(center_x: f32, center_y: f32, radius: f32) -> Self {
        Self { center_x, center_y, radius }
    }
}

/// グレースケール画像から半径範囲内の円を探す
///
/// 候補は確からしい順に返す。見つからなければ空。
pub trait CircleDetector {
    fn detect(&self, gray: &GrayImage, min_radius: u32, max_radius: u32) -> Vec<MarkerDetection>;
}

impl<T: CircleDetector + ?Sized> CircleDetector for &T {
    fn detect(&self, gray: &GrayImage, min_radius: u32, max_radius: u32) -> Vec<MarkerDetection> {
        (**self).detect(gray, min_radius, max_radius)
    }
}

/// 勾配方向ハフ変換による円検出
#[derive(Debug, Clone)]
pub struct HoughCircleDetector {
    pub canny_low: f32,
    pub canny_high: f32,
    /// 円周長に対する最低得票率
    pub min_vote_ratio: f32,
    /// 返す候補の上限
    pub max_candidates: usize,
}

impl Default for HoughCircleDetector {
    fn default() -> Self {
        Self {
            canny_low: 50.0,
            canny_high: 100.0,
            min_vote_ratio: 0.35,
            max_candidates: 256,
        }
    }
}

impl CircleDetector for HoughCircleDetector {
    fn detect(&self, gray: &GrayImage, min_radius: u32, max_radius: u32) -> Vec<MarkerDetection> {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 || min_radius == 0 || min_radius > max_radius {
            return Vec::new();
        }

        let edges = canny(gray, self.canny_low, self.canny_high);
        let gx = horizontal_sobel(gray);
        let gy = vertical_sobel(gray);

        // エッジ点と単位勾配ベクトル
        let mut edge_points = Vec::new();
        for (x, y, pixel) in edges.enumerate_pixels() {
            if pixel[0] == 0 {
                continue;
            }
            let dx = gx.get_pixel(x, y)[0] as f32;
            let dy = gy.get_pixel(x, y)[0] as f32;
            let norm = (dx * dx + dy * dy).sqrt();
            if norm > 0.0 {
                edge_points.push((x as f32, y as f32, dx / norm, dy / norm));
            }
        }
        if edge_points.is_empty() {
            return Vec::new();
        }

        let w = width as i64;
        let h = height as i64;
        let mut accumulator = vec![0u32; (width * height) as usize];
        // (正規化得票, x, y, r)
        let mut candidates: Vec<(f32, u32, u32, u32)> = Vec::new();

        for radius in min_radius..=max_radius {
            accumulator.iter_mut().for_each(|v| *v = 0);
            let r = radius as f32;
            for &(x, y, ux, uy) in &edge_points {
                for sign in [-1.0f32, 1.0] {
                    let cx = (x + sign * r * ux).round() as i64;
                    let cy = (y + sign * r * uy).round() as i64;
                    if cx >= 0 && cy >= 0 && cx < w && cy < h {
                        accumulator[(cy * w + cx) as usize] += 1;
                    }
                }
            }

            let circumference = 2.0 * std::f32::consts::PI * r;
            let threshold = self.min_vote_ratio * circumference;
            for cy in 0..h {
                for cx in 0..w {
                    if accumulator[(cy * w + cx) as usize] == 0 {
                        continue;
                    }
                    // 丸め誤差を吸収するため 3x3 近傍の合計で評価
                    let mut votes = 0u32;
                    for ny in (cy - 1).max(0)..=(cy + 1).min(h - 1) {
                        for nx in (cx - 1).max(0)..=(cx + 1).min(w - 1) {
                            votes += accumulator[(ny * w + nx) as usize];
                        }
                    }
                    if votes as f32 >= threshold {
                        candidates.push((votes as f32 / circumference, cx as u32, cy as u32, radius));
                    }
                }
            }
        }

        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        // 近すぎる中心を抑制
        let min_distance = min_radius as f32;
        let mut detections: Vec<MarkerDetection> = Vec::new();
        for (_, cx, cy, r) in candidates {
            let (cx, cy) = (cx as f32, cy as f32);
            let too_close = detections.iter().any(|d| {
                let (dx, dy) = (d.center_x - cx, d.center_y - cy);
                (dx * dx + dy * dy).sqrt() < min_distance
            });
            if !too_close {
                detections.push(MarkerDetection::new(cx, cy, r as f32));
                if detections.len() >= self.max_candidates {
                    break;
                }
            }
        }

        detections
    }
}
