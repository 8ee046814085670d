//! モデル推論機能

use anyhow::Result;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use image::RgbImage;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::ml::augment::CROP_SIZE;
use crate::ml::ml_model::{ItemClassifier, ModelConfig};
use crate::ml::prediction::{self, CropClassifier, Prediction};
use crate::model::{
    load_model_with_metadata, print_metadata_info, save_model_with_metadata, IdentifierIndex, ModelMetadata,
    TrainingSettings,
};

/// チェックポイントから復元した分類器
pub struct Predictor<B: Backend> {
    model: ItemClassifier<B>,
    index: IdentifierIndex,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    /// チェックポイントを読み込んで推論器を初期化
    ///
    /// チェックポイントの idx2id は `index` と完全に一致していなければならない。
    pub fn load(checkpoint_path: &Path, index: IdentifierIndex, device: &B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(checkpoint_path)?;

        if metadata.num_classes != index.len() {
            return Err(PipelineError::CheckpointShapeMismatch {
                expected: index.len(),
                found: metadata.num_classes,
            }
            .into());
        }
        // 同じクラス数でも並びが違えば重みとアイテムIDの対応が崩れる
        if let Some((position, (expected, found))) = index
            .identifiers()
            .iter()
            .zip(&metadata.idx2id)
            .enumerate()
            .find(|(_, (current, saved))| current != saved)
        {
            return Err(PipelineError::CheckpointLabelMismatch {
                position,
                expected: expected.as_str().to_string(),
                found: found.as_str().to_string(),
            }
            .into());
        }

        let model = ModelConfig::new(index.len()).init::<B>(device);

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        log::info!("チェックポイントを読み込みました: {}", checkpoint_path.display());
        print_metadata_info(&metadata);

        Ok(Self {
            model,
            index,
            device: device.clone(),
        })
    }

    /// 学習直後のモデルから推論器を作る
    pub fn from_model(model: ItemClassifier<B>, index: IdentifierIndex, device: &B::Device) -> Result<Self> {
        if model.num_classes() != index.len() {
            return Err(PipelineError::CheckpointShapeMismatch {
                expected: index.len(),
                found: model.num_classes(),
            }
            .into());
        }
        Ok(Self {
            model,
            index,
            device: device.clone(),
        })
    }

    pub fn model(&self) -> &ItemClassifier<B> {
        &self.model
    }

    /// 切り出し列のクラス確率 `[N, num_classes]`
    pub fn probabilities(&self, crops: &[RgbImage]) -> Result<Vec<f32>> {
        let data = prediction::stack_crops(crops)?;
        let size = CROP_SIZE as usize;
        let images = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape([crops.len(), 3, size, size]);

        let output = softmax(self.model.forward(images), 1);
        output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))
    }
}

impl<B: Backend> CropClassifier for Predictor<B> {
    fn predict(&self, crops: &[RgbImage]) -> Result<Vec<Prediction>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }
        let probs = self.probabilities(crops)?;
        prediction::top1_predictions(&probs, self.index.len(), &self.index)
    }

    fn index(&self) -> &IdentifierIndex {
        &self.index
    }
}

/// モデルの重みをメタデータと共に保存する
pub fn save_checkpoint<B: Backend>(
    model: ItemClassifier<B>,
    index: &IdentifierIndex,
    settings: &TrainingSettings,
    output_path: &Path,
) -> Result<PathBuf> {
    // f32 精度で保存
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))?;

    let metadata = ModelMetadata::new(index.identifiers().to_vec(), CROP_SIZE, settings.steps, settings.learning_rate);
    let path = save_model_with_metadata(output_path, &metadata, &model_binary)?;
    log::info!(
        "チェックポイントを保存しました: {} ({:.2} MB)",
        path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );
    Ok(path)
}
