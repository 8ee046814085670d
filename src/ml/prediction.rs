//! 推論結果と、推論器に共通のインターフェース

use anyhow::Result;
use image::RgbImage;

use crate::ml::augment::{self, CROP_SIZE};
use crate::model::{IdentifierIndex, ItemIdentifier};

/// 1枚の切り出しに対する推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub identifier: ItemIdentifier,
    /// 予測クラスのソフトマックス確率 [0, 1]
    pub confidence: f32,
}

/// 64x64 の切り出し列をアイテムIDに分類するもの
///
/// Burn のチェックポイントからの推論器と、エクスポート済みグラフの推論器がある。
pub trait CropClassifier {
    /// 入力と同じ長さの結果を返す
    fn predict(&self, crops: &[RgbImage]) -> Result<Vec<Prediction>>;

    fn index(&self) -> &IdentifierIndex;
}

/// 切り出し列を `[N, 3, 64, 64]` の planar 配列に積む
pub fn stack_crops(crops: &[RgbImage]) -> Result<Vec<f32>> {
    let mut data = Vec::with_capacity(crops.len() * 3 * (CROP_SIZE * CROP_SIZE) as usize);
    for (i, crop) in crops.iter().enumerate() {
        if crop.dimensions() != (CROP_SIZE, CROP_SIZE) {
            let (w, h) = crop.dimensions();
            anyhow::bail!("切り出し {} のサイズが不正です: {}x{} (期待: {}x{})", i, w, h, CROP_SIZE, CROP_SIZE);
        }
        data.extend(augment::to_planar(crop));
    }
    Ok(data)
}

/// 行ごとのソフトマックス（数値安定版）
pub fn softmax_rows(scores: &[f32], num_classes: usize) -> Vec<f32> {
    let mut probs = Vec::with_capacity(scores.len());
    for row in scores.chunks(num_classes.max(1)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = row.iter().map(|&s| (s - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        probs.extend(exps.into_iter().map(|e| e / sum));
    }
    probs
}

/// 確率行列 `[N, num_classes]` から各行の最大クラスと確率を取り出す
///
/// 同率の場合は小さいインデックスを選ぶ。
pub fn top1_predictions(probs: &[f32], num_classes: usize, index: &IdentifierIndex) -> Result<Vec<Prediction>> {
    if num_classes == 0 || probs.len() % num_classes != 0 {
        anyhow::bail!("確率行列の形が不正です: 要素数 {}, クラス数 {}", probs.len(), num_classes);
    }
    probs
        .chunks(num_classes)
        .map(|row| -> Result<Prediction> {
            let (best, confidence) = row
                .iter()
                .copied()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });
            let identifier = index
                .identifier(best)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", best))?;
            Ok(Prediction {
                identifier,
                confidence: confidence.clamp(0.0, 1.0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> IdentifierIndex {
        IdentifierIndex::from_identifiers(vec!["30012".into(), "30013".into(), "other".into()]).unwrap()
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let probs = softmax_rows(&[1.0, 2.0, 3.0, 1000.0, 0.0, -1000.0], 3);
        for row in probs.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }
        assert!(probs[3] > 0.999);
    }

    #[test]
    fn test_top1_maps_through_index() {
        let probs = [0.1, 0.7, 0.2, 0.05, 0.05, 0.9];
        let predictions = top1_predictions(&probs, 3, &index()).unwrap();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].identifier.as_str(), "30013");
        assert!((predictions[0].confidence - 0.7).abs() < 1e-6);
        assert!(predictions[1].identifier.is_other());
    }

    #[test]
    fn test_top1_rejects_bad_shape() {
        assert!(top1_predictions(&[0.5, 0.5], 3, &index()).is_err());
    }

    #[test]
    fn test_stack_crops_checks_size() {
        let ok = vec![RgbImage::new(64, 64); 2];
        assert_eq!(stack_crops(&ok).unwrap().len(), 2 * 3 * 64 * 64);
        assert!(stack_crops(&[RgbImage::new(32, 64)]).is_err());
    }
}
