//! 画面内のアイテム位置の特定

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::error::PipelineError;
use crate::ml::augment;
use crate::model::LocatorSettings;
use crate::screen::circles::{CircleDetector, MarkerDetection};

/// 生の切り出しの半径に対する倍率（半辺長 = 1.2r）
const RAW_HALF_EXTENT: f32 = 1.2;

/// 画面上の1アイテム
#[derive(Debug, Clone)]
pub struct LocatedItem {
    /// 保存・目視確認用の元解像度の切り出し
    pub raw: RgbImage,
    /// モデル入力用の 64x64 切り出し
    pub normalized: RgbImage,
    /// 基準高さに拡大縮小した画面上のマーカー
    pub marker: MarkerDetection,
}

/// スクリーンショットからアイテム領域を列挙する
pub trait ItemLocator {
    fn locate(&self, screen: &RgbImage) -> Result<Vec<LocatedItem>>;
}

/// 円形マーカーを手がかりにアイテムを探す
pub struct CircleItemLocator<D: CircleDetector> {
    detector: D,
    settings: LocatorSettings,
}

impl<D: CircleDetector> CircleItemLocator<D> {
    pub fn new(detector: D, settings: LocatorSettings) -> Self {
        Self { detector, settings }
    }

    /// 基準高さに拡大縮小する
    fn rescale(&self, screen: &RgbImage) -> RgbImage {
        let (width, height) = screen.dimensions();
        let target = self.settings.reference_height;
        if height == target || height == 0 {
            return screen.clone();
        }
        let scaled_width = ((width as f64) * (target as f64) / (height as f64)).round().max(1.0) as u32;
        imageops::resize(screen, scaled_width, target, FilterType::Triangle)
    }
}

/// 行ごと（上から下）、行内は左から右に並べる
///
/// 中心の y 差が半径未満なら同じ行とみなす。
pub fn sort_row_major(mut markers: Vec<MarkerDetection>) -> Vec<MarkerDetection> {
    markers.sort_by(|a, b| a.center_y.total_cmp(&b.center_y));

    let mut rows: Vec<Vec<MarkerDetection>> = Vec::new();
    for marker in markers {
        match rows.last_mut() {
            Some(row) if (marker.center_y - row[0].center_y).abs() < row[0].radius => row.push(marker),
            _ => rows.push(vec![marker]),
        }
    }

    rows.into_iter()
        .flat_map(|mut row| {
            row.sort_by(|a, b| a.center_x.total_cmp(&b.center_x));
            row
        })
        .collect()
}

/// マーカー周辺の正方形を切り出す
///
/// 正方形が画像からはみ出す場合は `None`（縦横比が崩れたサンプルを保存しない）。
pub fn raw_crop(screen: &RgbImage, marker: &MarkerDetection) -> Option<RgbImage> {
    let (width, height) = screen.dimensions();
    let half = marker.radius * RAW_HALF_EXTENT;
    let (left, top) = (marker.center_x - half, marker.center_y - half);
    let side = (2.0 * half) as u32;
    if left < 0.0 || top < 0.0 || side == 0 {
        return None;
    }
    let (x1, y1) = (left as u32, top as u32);
    if x1 + side > width || y1 + side > height {
        return None;
    }
    Some(imageops::crop_imm(screen, x1, y1, side, side).to_image())
}

impl<D: CircleDetector> ItemLocator for CircleItemLocator<D> {
    fn locate(&self, screen: &RgbImage) -> Result<Vec<LocatedItem>> {
        let scaled = self.rescale(screen);
        let gray = imageops::grayscale(&scaled);
        let markers = self
            .detector
            .detect(&gray, self.settings.min_radius, self.settings.max_radius);
        log::debug!("マーカー候補: {} 個", markers.len());

        let mut items = Vec::new();
        for marker in sort_row_major(markers) {
            let normalized =
                match augment::crop_item_middle(&scaled, marker.center_x, marker.center_y, marker.radius) {
                    Ok(crop) => crop,
                    Err(e) if matches!(e.downcast_ref::<PipelineError>(), Some(PipelineError::CropOutOfBounds { .. })) => {
                        log::debug!("画面端のアイテムをスキップ: {:?}", marker);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
            let Some(raw) = raw_crop(&scaled, &marker) else {
                log::debug!("保存用の切り出しが画面に収まらないためスキップ: {:?}", marker);
                continue;
            };
            items.push(LocatedItem { raw, normalized, marker });
        }

        log::info!("{} 個のアイテムを検出しました", items.len());
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Rgb};

    struct ScriptedDetector(Vec<MarkerDetection>);

    impl CircleDetector for ScriptedDetector {
        fn detect(&self, _gray: &GrayImage, _min: u32, _max: u32) -> Vec<MarkerDetection> {
            self.0.clone()
        }
    }

    #[test]
    fn test_sort_row_major() {
        let sorted = sort_row_major(vec![
            MarkerDetection::new(300.0, 104.0, 60.0),
            MarkerDetection::new(100.0, 400.0, 60.0),
            MarkerDetection::new(100.0, 100.0, 60.0),
            MarkerDetection::new(300.0, 398.0, 60.0),
        ]);
        let centers: Vec<(f32, f32)> = sorted.iter().map(|m| (m.center_x, m.center_y)).collect();
        assert_eq!(centers, vec![(100.0, 100.0), (300.0, 104.0), (100.0, 400.0), (300.0, 398.0)]);
    }

    #[test]
    fn test_raw_crop_is_square_or_none() {
        let screen = RgbImage::new(200, 200);
        let crop = raw_crop(&screen, &MarkerDetection::new(100.0, 100.0, 50.0)).unwrap();
        assert_eq!(crop.dimensions(), (120, 120));
        assert!(raw_crop(&screen, &MarkerDetection::new(20.0, 100.0, 50.0)).is_none());
        assert!(raw_crop(&screen, &MarkerDetection::new(100.0, 170.0, 50.0)).is_none());
    }

    #[test]
    fn test_locate_skips_items_at_the_edge() {
        let screen = RgbImage::from_pixel(1280, 720, Rgb([90, 90, 90]));
        let locator = CircleItemLocator::new(
            ScriptedDetector(vec![
                MarkerDetection::new(200.0, 200.0, 60.0),
                MarkerDetection::new(10.0, 200.0, 60.0),
                // モデル入力の窓は収まるが、保存用の正方形ははみ出す
                MarkerDetection::new(60.0, 400.0, 60.0),
                MarkerDetection::new(400.0, 200.0, 60.0),
            ]),
            LocatorSettings::default(),
        );
        let items = locator.locate(&screen).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].marker.center_x, 200.0);
        assert_eq!(items[0].normalized.dimensions(), (64, 64));
        assert_eq!(items[0].raw.dimensions(), (144, 144));
    }

    #[test]
    fn test_screen_is_rescaled_to_reference_height() {
        let screen = RgbImage::new(2560, 1440);
        let locator = CircleItemLocator::new(ScriptedDetector(Vec::new()), LocatorSettings::default());
        assert_eq!(locator.rescale(&screen).dimensions(), (1280, 720));
        assert!(locator.locate(&screen).unwrap().is_empty());
    }
}
