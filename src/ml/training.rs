//! モデル学習
//!
//! 検証データは使わず、毎ステップ新しく組み立てたバッチで学習と評価を行います。

use anyhow::{Context, Result};
use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion, Int, Tensor},
};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::ml::dataset::{AssembledBatch, DatasetAssembler, SampleSet};
use crate::ml::graph::export_inference_graph;
use crate::ml::inference::save_checkpoint;
use crate::ml::ml_model::{ItemClassifier, ModelConfig};
use crate::model::{AppConfig, IdentifierIndex, TrainingSettings};
use crate::screen::CircleDetector;

/// 1ステップの記録
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StepLog {
    pub step: usize,
    pub loss: f64,
    pub accuracy: f64,
}

/// 学習結果
pub struct TrainedModel<B: AutodiffBackend> {
    /// 推論用（勾配なし）のモデル
    pub model: ItemClassifier<B::InnerBackend>,
    /// 最後のステップで使ったバッチ（エクスポートのトレースに使う）
    pub last_batch: AssembledBatch,
    pub history: Vec<StepLog>,
}

/// 学習ログを CSV に書き出す
struct TrainingLog {
    writer: csv::Writer<std::fs::File>,
}

impl TrainingLog {
    fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("学習ログを作成できません: {}", path.display()))?;
        Ok(Self { writer })
    }

    fn append(&mut self, record: &StepLog) -> Result<()> {
        self.writer.serialize(record)?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// 行ごとの最大スコアのインデックスがラベルと一致する割合
fn top1_accuracy(scores: &[f32], labels: &[i64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let num_classes = scores.len() / labels.len();
    let correct = scores
        .chunks(num_classes.max(1))
        .zip(labels)
        .filter(|(row, &label)| {
            let best = row
                .iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc })
                .0;
            best as i64 == label
        })
        .count();
    correct as f64 / labels.len() as f64
}

/// 固定ステップ数の学習を行う
///
/// 毎ステップ `assembler` から新しいバッチを取り、交差エントロピーで Adam を1回更新する。
/// バッチの組み立てに失敗した場合は学習全体を中断する。
pub fn train<B: AutodiffBackend>(
    assembler: &mut DatasetAssembler<'_>,
    num_classes: usize,
    settings: &TrainingSettings,
    log_path: Option<&Path>,
    device: &B::Device,
) -> Result<TrainedModel<B>> {
    if settings.steps == 0 {
        anyhow::bail!("学習ステップ数が0です");
    }

    let mut model: ItemClassifier<B> = ModelConfig::new(num_classes).init(device);
    let mut optim = AdamConfig::new().init();
    let mut log = log_path.map(TrainingLog::create).transpose()?;
    let mut history = Vec::with_capacity(settings.steps);
    let mut last_batch = None;

    log::info!(
        "学習を開始します: {} ステップ, 学習率 {}, 1バッチ {} 枚, {} クラス",
        settings.steps,
        settings.learning_rate,
        assembler.batch_len(),
        num_classes
    );

    for step in 0..settings.steps {
        let batch = assembler
            .next_batch()
            .with_context(|| format!("ステップ {} のバッチ作成に失敗しました", step))?;

        let images = Tensor::<B, 1>::from_floats(batch.images.as_slice(), device).reshape(batch.shape());
        let targets = Tensor::<B, 1, Int>::from_ints(batch.labels.as_slice(), device);

        let output = model.forward_classification(images, targets);
        let loss = output.loss.clone().into_scalar().elem::<f64>();
        let scores = output
            .output
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("出力の取得エラー: {:?}", e))?;
        let accuracy = top1_accuracy(&scores, &batch.labels);

        let grads = GradientsParams::from_grads(output.loss.backward(), &model);
        model = optim.step(settings.learning_rate, model, grads);

        let record = StepLog { step, loss, accuracy };
        if settings.should_log(step) {
            log::info!("step {:>4}  loss {:.6}  accuracy {:.4}", step, loss, accuracy);
        }
        if let Some(log) = log.as_mut() {
            log.append(&record)?;
        }
        history.push(record);
        last_batch = Some(batch);
    }

    if let Some(log) = log {
        log.finish()?;
    }

    let last_batch = last_batch.ok_or_else(|| anyhow::anyhow!("バッチが1つも作られませんでした"))?;
    Ok(TrainedModel {
        model: model.valid(),
        last_batch,
        history,
    })
}

/// 学習パイプラインの成果物
#[derive(Debug, Clone)]
pub struct TrainingArtifacts {
    pub checkpoint: PathBuf,
    pub inference_graph: PathBuf,
    pub final_step: Option<StepLog>,
}

/// 収集画像から学習し、チェックポイントと推論グラフを書き出す
///
/// 1. インデックスを作り直して保存
/// 2. 全サンプルを読み込み、`detector` でマーカーを検出
/// 3. 学習
/// 4. チェックポイント保存、最後のバッチでグラフをエクスポート
///
/// エクスポートに失敗してもチェックポイントは残る。
pub fn run_training<B: AutodiffBackend, D: CircleDetector>(
    config: &AppConfig,
    detector: &D,
    device: &B::Device,
) -> Result<TrainingArtifacts> {
    let paths = &config.paths;

    let index = IdentifierIndex::build_and_save(&paths.sample_store, &paths.index_file)?;

    let samples = SampleSet::load_all(&paths.sample_store, config.augment.sample_size)?;
    if samples.is_empty() {
        anyhow::bail!("学習データが見つかりません: {}", paths.sample_store.display());
    }
    log::info!("サンプル数: {}", samples.len());

    let mut assembler = DatasetAssembler::new(
        &samples,
        &index,
        detector,
        config.augment.clone(),
        config.training.shuffle_seed,
        config.training.jitter_seed,
    )?;

    let trained = train::<B>(
        &mut assembler,
        index.len(),
        &config.training,
        Some(&paths.training_log),
        device,
    )?;
    let final_step = trained.history.last().copied();

    let checkpoint = save_checkpoint(trained.model.clone(), &index, &config.training, &paths.checkpoint)?;
    let inference_graph = export_inference_graph(
        &trained.model,
        &trained.last_batch.images,
        &index,
        &paths.inference_graph,
        device,
    )
    .with_context(|| format!("チェックポイントは保存済みです: {}", checkpoint.display()))?;

    Ok(TrainingArtifacts {
        checkpoint,
        inference_graph,
        final_step,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::{write_png, FixedDetector};
    use crate::ml::graph::load_graph_bundle;
    use crate::ml::inference::Predictor;
    use crate::ml::prediction::CropClassifier;
    use crate::model::AugmentSettings;
    use crate::screen::MarkerDetection;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_top1_accuracy() {
        let scores = [0.9, 0.1, 0.2, 0.8, 0.6, 0.4];
        assert_eq!(top1_accuracy(&scores, &[0, 1, 1]), 2.0 / 3.0);
        assert_eq!(top1_accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_training_separates_two_colors() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "1", "a.png", [220, 20, 20]);
        write_png(dir.path(), "2", "b.png", [20, 20, 220]);

        let index = IdentifierIndex::build(dir.path()).unwrap();
        let samples = SampleSet::load_all(dir.path(), 128).unwrap();
        let detector = FixedDetector(Some(MarkerDetection::new(64.0, 70.0, 40.0)));
        let mut assembler =
            DatasetAssembler::new(&samples, &index, &detector, AugmentSettings::default(), 321, Some(3)).unwrap();

        let settings = TrainingSettings {
            steps: 80,
            ..TrainingSettings::default()
        };
        let log_path = dir.path().join("log").join("training_log.csv");
        let device = Default::default();
        let trained = train::<TestBackend>(&mut assembler, index.len(), &settings, Some(&log_path), &device).unwrap();

        assert_eq!(trained.history.len(), 80);
        assert_eq!(trained.last_batch.len(), 20);
        let first = trained.history.first().unwrap().loss;
        let last = trained.history.last().unwrap().loss;
        assert!(last < first, "loss {} -> {}", first, last);

        let log_lines = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log_lines.lines().count(), 81);
        assert!(log_lines.starts_with("step,loss,accuracy"));

        let predictor = Predictor::from_model(trained.model, index, &device).unwrap();
        let crops = vec![
            RgbImage::from_pixel(64, 64, Rgb([220, 20, 20])),
            RgbImage::from_pixel(64, 64, Rgb([20, 20, 220])),
        ];
        let predictions = predictor.predict(&crops).unwrap();
        assert_eq!(predictions[0].identifier.as_str(), "1");
        assert_eq!(predictions[1].identifier.as_str(), "2");
        assert!(predictions.iter().all(|p| p.confidence > 0.9), "{:?}", predictions);
    }

    #[test]
    fn test_zero_steps_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "1", "a.png", [220, 20, 20]);
        let index = IdentifierIndex::build(dir.path()).unwrap();
        let samples = SampleSet::load_all(dir.path(), 128).unwrap();
        let detector = FixedDetector(Some(MarkerDetection::new(64.0, 70.0, 40.0)));
        let mut assembler =
            DatasetAssembler::new(&samples, &index, &detector, AugmentSettings::default(), 321, None).unwrap();
        let settings = TrainingSettings {
            steps: 0,
            ..TrainingSettings::default()
        };
        let device = Default::default();
        assert!(train::<TestBackend>(&mut assembler, 1, &settings, None, &device).is_err());
    }

    #[test]
    fn test_run_training_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("collect");
        write_png(&store, "30012", "a.png", [220, 20, 20]);
        write_png(&store, "30013", "b.png", [20, 20, 220]);

        let mut config = AppConfig::default();
        config.paths.sample_store = store;
        config.paths.index_file = dir.path().join("index_itemid_relation.json");
        config.paths.checkpoint = dir.path().join("models").join("item_classifier.tar.gz");
        config.paths.inference_graph = dir.path().join("models").join("item_classifier_graph.tar.gz");
        config.paths.training_log = dir.path().join("models").join("training_log.csv");
        config.training.steps = 3;
        config.training.jitter_seed = Some(7);

        let detector = FixedDetector(Some(MarkerDetection::new(64.0, 70.0, 40.0)));
        let device = Default::default();
        let artifacts = run_training::<TestBackend, _>(&config, &detector, &device).unwrap();

        assert_eq!(artifacts.final_step.unwrap().step, 2);
        assert_eq!(artifacts.checkpoint, config.paths.checkpoint);
        assert_eq!(artifacts.inference_graph, config.paths.inference_graph);

        let index = IdentifierIndex::load(&config.paths.index_file).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.identifiers()[1].as_str(), "30013");

        let predictor = Predictor::<NdArray<f32>>::load(&artifacts.checkpoint, index, &device).unwrap();
        assert_eq!(predictor.model().num_classes(), 2);

        let (metadata, graph) = load_graph_bundle(&artifacts.inference_graph).unwrap();
        assert_eq!(metadata.trace_shape, [20, 3, 64, 64]);
        assert_eq!(graph.num_classes(), 2);

        let log_lines = std::fs::read_to_string(&config.paths.training_log).unwrap();
        assert_eq!(log_lines.lines().count(), 4);
    }
}
