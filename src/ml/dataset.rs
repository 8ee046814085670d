//! 収集画像の読み込みと学習バッチの生成

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{GrayImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::ml::augment::{self, CROP_SIZE};
use crate::model::{AugmentSettings, IdentifierIndex, ItemIdentifier};
use crate::screen::{CircleDetector, MarkerDetection};

/// 読み込み済みの収集画像
#[derive(Debug, Clone)]
pub struct LoadedSample {
    pub path: PathBuf,
    /// 親ディレクトリ名
    pub identifier: ItemIdentifier,
    pub color: RgbImage,
    pub gray: GrayImage,
}

/// 収集ディレクトリ全体（パス順）
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    samples: BTreeMap<PathBuf, LoadedSample>,
}

impl SampleSet {
    /// 収集ディレクトリを再帰的に走査して全画像を読み込む
    ///
    /// デコードできないファイルは警告を出してスキップする。
    pub fn load_all(sample_store_root: &Path, sample_size: u32) -> Result<Self> {
        let mut files = Vec::new();
        collect_files(sample_store_root, &mut files)?;
        files.sort();

        let mut samples = BTreeMap::new();
        let mut skipped = 0usize;
        for path in files {
            let in_item_dir = path.parent().is_some_and(|parent| parent != sample_store_root);
            let Some(identifier) = parent_identifier(&path).filter(|_| in_item_dir) else {
                log::warn!("アイテムディレクトリ外のファイルを無視します: {}", path.display());
                continue;
            };
            match decode_sample(&path, sample_size) {
                Ok((color, gray)) => {
                    samples.insert(path.clone(), LoadedSample { path, identifier, color, gray });
                }
                Err(e) => {
                    log::warn!("{}", e);
                    skipped += 1;
                }
            }
        }

        log::info!(
            "{} 枚の収集画像を読み込みました（スキップ {} 枚）: {}",
            samples.len(),
            skipped,
            sample_store_root.display()
        );
        Ok(Self { samples })
    }

    pub fn from_samples(samples: impl IntoIterator<Item = LoadedSample>) -> Self {
        Self {
            samples: samples.into_iter().map(|s| (s.path.clone(), s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&LoadedSample> {
        self.samples.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.samples.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedSample> {
        self.samples.values()
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), files)?;
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}

fn parent_identifier(path: &Path) -> Option<ItemIdentifier> {
    path.parent()?
        .file_name()?
        .to_str()
        .map(ItemIdentifier::new)
}

/// 画像を読み込み、正方形にリサイズしてアルファを落とし、グレースケールも作る
pub fn decode_sample(path: &Path, sample_size: u32) -> Result<(RgbImage, GrayImage)> {
    let decode_error = |message: String| PipelineError::Decode {
        path: path.to_path_buf(),
        message,
    };
    let bytes = fs::read(path).map_err(|e| decode_error(e.to_string()))?;
    let image = image::load_from_memory(&bytes).map_err(|e| decode_error(e.to_string()))?;
    let color = image
        .resize_exact(sample_size, sample_size, FilterType::Triangle)
        .to_rgb8();
    let gray = image::imageops::grayscale(&color);
    Ok((color, gray))
}

/// ラベル付きの 64x64 切り出し
#[derive(Debug, Clone)]
pub struct TrainingCrop {
    pub image: RgbImage,
    pub label: usize,
}

/// 1ステップ分のバッチ（CHW に並べ替え済み）
#[derive(Debug, Clone)]
pub struct AssembledBatch {
    /// N x 3 x 64 x 64
    pub images: Vec<f32>,
    pub labels: Vec<i64>,
}

impl AssembledBatch {
    pub fn from_crops(crops: &[TrainingCrop]) -> Self {
        let mut images = Vec::with_capacity(crops.len() * 3 * (CROP_SIZE * CROP_SIZE) as usize);
        let mut labels = Vec::with_capacity(crops.len());
        for crop in crops {
            images.extend(augment::to_planar(&crop.image));
            labels.push(crop.label as i64);
        }
        Self { images, labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `[N, 3, 64, 64]`
    pub fn shape(&self) -> [usize; 4] {
        [self.len(), 3, CROP_SIZE as usize, CROP_SIZE as usize]
    }
}

/// 固定シードの順列でシャッフルする
///
/// 同じ長さの入力には毎回同じ順列が適用される。
pub fn shuffle_with_seed<T>(items: Vec<T>, seed: u64) -> Vec<T> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// ランダムノイズの "other" サンプル
///
/// テスト用のデータ。学習パイプラインでは使わない。
pub fn noise_crops<R: Rng>(index: &IdentifierIndex, count: usize, rng: &mut R) -> Result<Vec<TrainingCrop>> {
    let label = index
        .index_of(&ItemIdentifier::other())
        .ok_or_else(|| PipelineError::UnknownIdentifier(ItemIdentifier::OTHER.to_string()))?;
    Ok((0..count)
        .map(|_| TrainingCrop {
            image: RgbImage::from_fn(CROP_SIZE, CROP_SIZE, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()])),
            label,
        })
        .collect())
}

/// 1サンプル分の検出結果
#[derive(Debug, Clone)]
struct PreparedSample {
    path: PathBuf,
    label: usize,
    crops: usize,
    marker: MarkerDetection,
}

/// 収集画像とインデックスから学習バッチを作る
///
/// マーカー検出は決定的なので構築時に1回だけ行う。
pub struct DatasetAssembler<'a> {
    samples: &'a SampleSet,
    prepared: Vec<PreparedSample>,
    settings: AugmentSettings,
    shuffle_seed: u64,
    jitter_rng: StdRng,
}

impl<'a> DatasetAssembler<'a> {
    /// 全サンプルでマーカーを検出する
    ///
    /// 1枚でも検出できなければ `NoMarkerDetected` で失敗する（収集画像を見直すこと）。
    pub fn new<D: CircleDetector>(
        samples: &'a SampleSet,
        index: &IdentifierIndex,
        detector: &D,
        settings: AugmentSettings,
        shuffle_seed: u64,
        jitter_seed: Option<u64>,
    ) -> Result<Self> {
        let mut prepared = Vec::with_capacity(samples.len());
        for sample in samples.iter() {
            let label = index
                .index_of(&sample.identifier)
                .ok_or_else(|| PipelineError::UnknownIdentifier(sample.identifier.to_string()))?;

            let marker = detector
                .detect(&sample.gray, settings.marker_min_radius, settings.marker_max_radius)
                .into_iter()
                .next()
                .ok_or_else(|| PipelineError::NoMarkerDetected { path: sample.path.clone() })?;
            log::debug!(
                "{}: マーカー ({:.1}, {:.1}) r={:.1}",
                sample.path.display(),
                marker.center_x,
                marker.center_y,
                marker.radius
            );

            prepared.push(PreparedSample {
                path: sample.path.clone(),
                label,
                crops: augment::crops_per_sample(&sample.identifier, settings.item_crops, settings.other_crops),
                marker,
            });
        }

        let jitter_rng = match jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            samples,
            prepared,
            settings,
            shuffle_seed,
            jitter_rng,
        })
    }

    /// 1バッチあたりの切り出し枚数
    pub fn batch_len(&self) -> usize {
        self.prepared.iter().map(|p| p.crops).sum()
    }

    /// ジッター付きで切り出し、固定シードでシャッフルしたラベル付き切り出し列
    pub fn next_crops(&mut self) -> Result<Vec<TrainingCrop>> {
        let mut crops = Vec::with_capacity(self.batch_len());
        for prepared in &self.prepared {
            let sample = self
                .samples
                .get(&prepared.path)
                .ok_or_else(|| anyhow::anyhow!("サンプルが見つかりません: {}", prepared.path.display()))?;
            let images = augment::jittered_crops(
                &sample.color,
                &prepared.marker,
                prepared.crops,
                self.settings.jitter,
                &mut self.jitter_rng,
            )
            .with_context(|| format!("切り出しに失敗しました: {}", prepared.path.display()))?;
            crops.extend(images.into_iter().map(|image| TrainingCrop {
                image,
                label: prepared.label,
            }));
        }
        Ok(shuffle_with_seed(crops, self.shuffle_seed))
    }

    /// 1ステップ分のバッチ
    pub fn next_batch(&mut self) -> Result<AssembledBatch> {
        let crops = self.next_crops()?;
        Ok(AssembledBatch::from_crops(&crops))
    }
}
