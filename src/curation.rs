//! 収集ループ
//!
//! 画面のアイテムを分類し、必要なら人が確認したうえで収集ディレクトリに追加します。
//! 追加した画像は次回の学習で使われます。

use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

use crate::ml::prediction::{CropClassifier, Prediction};
use crate::model::ItemIdentifier;
use crate::screen::{ItemLocator, ReviewKey, Reviewer};

/// 収集画像の保存先 `root/<アイテムID>/<ミリ秒>.png`
#[derive(Debug, Clone)]
pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 画像を保存してパスを返す
    ///
    /// 同じミリ秒のファイルが既にあれば、空くまで値を進める。
    pub fn save(&self, id: &ItemIdentifier, image: &RgbImage) -> Result<PathBuf> {
        let dir = self.root.join(id.as_str());
        std::fs::create_dir_all(&dir).with_context(|| format!("ディレクトリを作成できません: {}", dir.display()))?;

        let mut millis = chrono::Local::now().timestamp_millis();
        let mut path = dir.join(format!("{}.png", millis));
        while path.exists() {
            millis += 1;
            path = dir.join(format!("{}.png", millis));
        }

        image
            .save(&path)
            .with_context(|| format!("画像を保存できません: {}", path.display()))?;
        Ok(path)
    }
}

/// 1アイテムの処理結果
#[derive(Debug, Clone, PartialEq)]
pub struct CurationRecord {
    pub prediction: Prediction,
    /// 確認を求めたかどうか
    pub reviewed: bool,
    /// 保存に使ったラベル
    pub stored_as: ItemIdentifier,
    pub path: PathBuf,
}

/// 信頼度が閾値未満なら確認せずに "other" とする
pub fn needs_review(confidence: f32, threshold: f32) -> bool {
    confidence >= threshold
}

/// 確認結果から保存ラベルを決める
pub fn resolve_label(proposed: &ItemIdentifier, key: ReviewKey) -> ItemIdentifier {
    match key {
        ReviewKey::Confirm => proposed.clone(),
        ReviewKey::Reject => ItemIdentifier::other(),
    }
}

/// 分類器・位置特定・目視確認・保存先をまとめた収集ループ
pub struct CurationLoop<'a, C, L, R>
where
    C: CropClassifier,
    L: ItemLocator,
    R: Reviewer,
{
    classifier: &'a C,
    locator: &'a L,
    reviewer: &'a mut R,
    store: SampleStore,
    confidence_threshold: f32,
}

impl<'a, C, L, R> CurationLoop<'a, C, L, R>
where
    C: CropClassifier,
    L: ItemLocator,
    R: Reviewer,
{
    pub fn new(classifier: &'a C, locator: &'a L, reviewer: &'a mut R, store: SampleStore, confidence_threshold: f32) -> Self {
        Self {
            classifier,
            locator,
            reviewer,
            store,
            confidence_threshold,
        }
    }

    /// 1枚のスクリーンショットを処理する
    pub fn process(&mut self, screen: &RgbImage) -> Result<Vec<CurationRecord>> {
        let items = self.locator.locate(screen)?;
        if items.is_empty() {
            log::warn!("アイテムが見つかりませんでした");
            return Ok(Vec::new());
        }

        let crops: Vec<RgbImage> = items.iter().map(|item| item.normalized.clone()).collect();
        let predictions = self.classifier.predict(&crops)?;

        let mut records = Vec::with_capacity(items.len());
        for (item, prediction) in items.iter().zip(predictions) {
            let reviewed = needs_review(prediction.confidence, self.confidence_threshold);
            let stored_as = if reviewed {
                let key = self.reviewer.review(&item.raw, &prediction.identifier, prediction.confidence)?;
                resolve_label(&prediction.identifier, key)
            } else {
                ItemIdentifier::other()
            };

            let path = self.store.save(&stored_as, &item.raw)?;
            log::info!(
                "{} ({:.3}) -> {} : {}",
                prediction.identifier,
                prediction.confidence,
                stored_as,
                path.display()
            );
            records.push(CurationRecord {
                prediction,
                reviewed,
                stored_as,
                path,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdentifierIndex;
    use crate::screen::{LocatedItem, MarkerDetection};
    use image::Rgb;
    use std::collections::VecDeque;

    struct FixedClassifier {
        index: IdentifierIndex,
        results: Vec<Prediction>,
    }

    impl CropClassifier for FixedClassifier {
        fn predict(&self, crops: &[RgbImage]) -> Result<Vec<Prediction>> {
            Ok(self.results.iter().take(crops.len()).cloned().collect())
        }

        fn index(&self) -> &IdentifierIndex {
            &self.index
        }
    }

    struct FixedLocator(usize);

    impl ItemLocator for FixedLocator {
        fn locate(&self, _screen: &RgbImage) -> Result<Vec<LocatedItem>> {
            Ok((0..self.0)
                .map(|i| LocatedItem {
                    raw: RgbImage::from_pixel(20, 20, Rgb([i as u8, 0, 0])),
                    normalized: RgbImage::new(64, 64),
                    marker: MarkerDetection::new(0.0, 0.0, 60.0),
                })
                .collect())
        }
    }

    struct ScriptedReviewer {
        keys: VecDeque<ReviewKey>,
        asked: usize,
    }

    impl Reviewer for ScriptedReviewer {
        fn review(&mut self, _crop: &RgbImage, _proposed: &ItemIdentifier, _confidence: f32) -> Result<ReviewKey> {
            self.asked += 1;
            self.keys.pop_front().ok_or_else(|| anyhow::anyhow!("予定外の確認"))
        }
    }

    fn prediction(id: &str, confidence: f32) -> Prediction {
        Prediction {
            identifier: ItemIdentifier::new(id),
            confidence,
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        assert!(needs_review(0.1, 0.1));
        assert!(!needs_review(0.099, 0.1));
        assert!(needs_review(0.95, 0.1));
    }

    #[test]
    fn test_resolve_label() {
        let id = ItemIdentifier::new("30012");
        assert_eq!(resolve_label(&id, ReviewKey::Confirm), id);
        assert!(resolve_label(&id, ReviewKey::Reject).is_other());
    }

    #[test]
    fn test_store_avoids_filename_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        let image = RgbImage::new(4, 4);
        let id = ItemIdentifier::new("30012");

        let paths: Vec<PathBuf> = (0..5).map(|_| store.save(&id, &image).unwrap()).collect();
        let mut unique = paths.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
        for path in &paths {
            assert_eq!(path.parent().unwrap(), dir.path().join("30012"));
            assert_eq!(path.extension().unwrap(), "png");
        }
    }

    #[test]
    fn test_curation_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = FixedClassifier {
            index: IdentifierIndex::from_identifiers(vec!["30012".into(), "30013".into(), "other".into()]).unwrap(),
            results: vec![
                prediction("30012", 0.95),
                prediction("30013", 0.099),
                prediction("30013", 0.1),
            ],
        };
        let locator = FixedLocator(3);
        let mut reviewer = ScriptedReviewer {
            keys: VecDeque::from(vec![ReviewKey::Confirm, ReviewKey::Reject]),
            asked: 0,
        };

        let mut curation = CurationLoop::new(&classifier, &locator, &mut reviewer, SampleStore::new(dir.path()), 0.1);
        let records = curation.process(&RgbImage::new(10, 10)).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].stored_as.as_str(), "30012");
        assert!(records[0].reviewed);
        assert!(records[1].stored_as.is_other());
        assert!(!records[1].reviewed);
        assert!(records[2].stored_as.is_other());
        assert!(records[2].reviewed);
        assert_eq!(reviewer.asked, 2);

        // raw の切り出しが保存される
        let saved = image::open(&records[0].path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (20, 20));
        assert!(dir.path().join("other").is_dir());
    }
}
