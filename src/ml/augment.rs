//! マーカー位置からアイコン中央部を切り出す
//!
//! 半径 60 を基準として比率 `ratio = radius / 60` を求め、
//! `x: [cx - 32r, cx + 32r]`、`y: [cy - 40r, cy + 24r]` を切り出して 64x64 に縮小します。
//! マーカーはアイコンの見た目の中心より下にあるので、縦方向は非対称です。
//! 定数は学習済みモデルとの互換性のため変更しないこと。

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;

use crate::error::PipelineError;
use crate::model::ItemIdentifier;
use crate::screen::MarkerDetection;

/// モデル入力サイズ
pub const CROP_SIZE: u32 = 64;

const REFERENCE_RADIUS: f32 = 60.0;
const HALF_WIDTH: f32 = 32.0;
const ABOVE: f32 = 40.0;
const BELOW: f32 = 24.0;

/// 中心 (cx, cy) と半径から 64x64 の切り出しを作る
///
/// 範囲は0方向に切り捨てる。画像外にはみ出す場合はエラー。
pub fn crop_item_middle(image: &RgbImage, center_x: f32, center_y: f32, radius: f32) -> Result<RgbImage> {
    let ratio = radius / REFERENCE_RADIUS;
    let y1 = (center_y - ABOVE * ratio) as i64;
    let y2 = (center_y + BELOW * ratio) as i64;
    let x1 = (center_x - HALF_WIDTH * ratio) as i64;
    let x2 = (center_x + HALF_WIDTH * ratio) as i64;

    let (width, height) = image.dimensions();
    if x1 < 0 || y1 < 0 || x2 > width as i64 || y2 > height as i64 || x2 <= x1 || y2 <= y1 {
        return Err(PipelineError::CropOutOfBounds { x1, y1, x2, y2, width, height }.into());
    }

    let window = imageops::crop_imm(image, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32).to_image();
    Ok(imageops::resize(&window, CROP_SIZE, CROP_SIZE, FilterType::Triangle))
}

/// 1枚のサンプルから何枚切り出すか
///
/// カタログアイテムは `item_crops` 枚、"other" などそれ以外は `other_crops` 枚。
pub fn crops_per_sample(id: &ItemIdentifier, item_crops: usize, other_crops: usize) -> usize {
    if id.is_catalog_id() {
        item_crops
    } else {
        other_crops
    }
}

/// 中心をずらしながら `count` 枚切り出す
///
/// ずらし量は各軸独立に `[-jitter, jitter)` の整数。
pub fn jittered_crops<R: Rng>(
    image: &RgbImage,
    marker: &MarkerDetection,
    count: usize,
    jitter: i32,
    rng: &mut R,
) -> Result<Vec<RgbImage>> {
    let mut crops = Vec::with_capacity(count);
    for _ in 0..count {
        let (dx, dy) = if jitter > 0 {
            (rng.gen_range(-jitter..jitter), rng.gen_range(-jitter..jitter))
        } else {
            (0, 0)
        };
        crops.push(crop_item_middle(
            image,
            marker.center_x + dx as f32,
            marker.center_y + dy as f32,
            marker.radius,
        )?);
    }
    Ok(crops)
}

/// HWC の画像を CHW (planar) の f32 列に変換する
///
/// 値は 0..=255 のまま（正規化しない）。
pub fn to_planar(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, pixel) in image.pixels().enumerate() {
        for channel in 0..3 {
            data[channel * plane + i] = pixel[channel] as f32;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient_image() -> RgbImage {
        RgbImage::from_fn(128, 128, |x, y| Rgb([x as u8 * 2, y as u8 * 2, ((x + y) % 256) as u8]))
    }

    #[test]
    fn test_crop_is_deterministic() {
        let image = gradient_image();
        let a = crop_item_middle(&image, 64.0, 70.0, 60.0).unwrap();
        let b = crop_item_middle(&image, 64.0, 70.0, 60.0).unwrap();
        assert_eq!(a.dimensions(), (64, 64));
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_crop_window_at_reference_radius() {
        // ratio = 1 のとき窓はちょうど 64x64 なので縮小なしの切り出しになる
        let image = gradient_image();
        let crop = crop_item_middle(&image, 64.0, 70.0, 60.0).unwrap();
        assert_eq!(crop.get_pixel(0, 0), image.get_pixel(32, 30));
        assert_eq!(crop.get_pixel(63, 63), image.get_pixel(95, 93));
    }

    #[test]
    fn test_crop_out_of_bounds() {
        let image = gradient_image();
        let err = crop_item_middle(&image, 10.0, 64.0, 60.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::CropOutOfBounds { x1: -22, .. })
        ));
        assert!(crop_item_middle(&image, 64.0, 120.0, 60.0).is_err());
    }

    #[test]
    fn test_crops_per_sample() {
        assert_eq!(crops_per_sample(&ItemIdentifier::new("30012"), 10, 1), 10);
        assert_eq!(crops_per_sample(&ItemIdentifier::other(), 10, 1), 1);
    }

    #[test]
    fn test_jittered_crops_stay_close() {
        let image = gradient_image();
        let marker = MarkerDetection::new(64.0, 70.0, 60.0);
        let mut rng = StdRng::seed_from_u64(7);
        let crops = jittered_crops(&image, &marker, 10, 3, &mut rng).unwrap();
        assert_eq!(crops.len(), 10);
        for crop in &crops {
            // 左上画素は (32±3, 30±3) 由来
            let [r, g, _] = crop.get_pixel(0, 0).0;
            assert!((58..=68).contains(&r), "r={}", r);
            assert!((54..=64).contains(&g), "g={}", g);
        }
    }

    #[test]
    fn test_to_planar_layout() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([1, 2, 3]));
        image.put_pixel(1, 0, Rgb([4, 5, 6]));
        assert_eq!(to_planar(&image), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }
}
