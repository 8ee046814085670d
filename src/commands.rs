//! 実行モード
//!
//! 学習・評価・収集・エクスポート・グラフ評価の5つ。バイナリの第1引数で選びます。

use anyhow::Result;
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_ndarray::NdArrayDevice;
use burn_wgpu::WgpuDevice;
use std::fmt;
use std::str::FromStr;

use crate::curation::{CurationLoop, SampleStore};
use crate::ml::graph::{export_inference_graph, GraphPredictor};
use crate::ml::inference::Predictor;
use crate::ml::prediction::{self, CropClassifier, Prediction};
use crate::ml::training::run_training;
use crate::model::{AppConfig, DeviceType, IdentifierIndex};
use crate::screen::{
    AdbCapture, CircleItemLocator, HoughCircleDetector, ItemLocator, LocatedItem, ScreenCapture, StaticScreenshot,
    TerminalReviewer,
};

/// 実行モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// 収集画像から学習し、チェックポイントと推論グラフを保存
    #[default]
    Train,
    /// 保存済みスクリーンショットをチェックポイントで分類
    Evaluate,
    /// 端末の画面を分類し、確認して収集ディレクトリに追加
    Curate,
    /// チェックポイントから推論グラフを書き出す
    Export,
    /// 保存済みスクリーンショットを推論グラフで分類
    EvaluateGraph,
}

impl Mode {
    pub const ALL: [Mode; 5] = [Mode::Train, Mode::Evaluate, Mode::Curate, Mode::Export, Mode::EvaluateGraph];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Evaluate => "evaluate",
            Mode::Curate => "curate",
            Mode::Export => "export",
            Mode::EvaluateGraph => "evaluate-graph",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Mode::ALL.iter().map(|m| m.as_str()).collect();
                anyhow::anyhow!("不明なモードです: {} (使用可能: {})", s, names.join(", "))
            })
    }
}

/// 設定の計算デバイスでモードを実行する
pub fn run(mode: Mode, config: &AppConfig) -> Result<()> {
    log::info!("モード: {} / デバイス: {}", mode, config.device_type);

    // グラフ評価は Burn を使わない
    if mode == Mode::EvaluateGraph {
        return evaluate_graph(config);
    }

    match config.device_type {
        DeviceType::Wgpu => run_with::<Autodiff<Wgpu>>(mode, config, &WgpuDevice::default()),
        DeviceType::Cpu => run_with::<Autodiff<NdArray>>(mode, config, &NdArrayDevice::Cpu),
    }
}

fn run_with<B: AutodiffBackend>(mode: Mode, config: &AppConfig, device: &B::Device) -> Result<()> {
    match mode {
        Mode::Train => train::<B>(config, device),
        Mode::Evaluate => evaluate::<B::InnerBackend>(config, device),
        Mode::Curate => curate::<B::InnerBackend>(config, device),
        Mode::Export => export::<B::InnerBackend>(config, device),
        Mode::EvaluateGraph => evaluate_graph(config),
    }
}

fn train<B: AutodiffBackend>(config: &AppConfig, device: &B::Device) -> Result<()> {
    config.display();
    let artifacts = run_training::<B, _>(config, &HoughCircleDetector::default(), device)?;
    if let Some(last) = artifacts.final_step {
        log::info!("最終ステップ {}: loss {:.6}, accuracy {:.4}", last.step, last.loss, last.accuracy);
    }
    log::info!("チェックポイント: {}", artifacts.checkpoint.display());
    log::info!("推論グラフ: {}", artifacts.inference_graph.display());
    Ok(())
}

fn item_locator(config: &AppConfig) -> CircleItemLocator<HoughCircleDetector> {
    CircleItemLocator::new(HoughCircleDetector::default(), config.locator.clone())
}

/// 保存済みスクリーンショットからアイテムを切り出す
fn locate_static_screenshot(config: &AppConfig) -> Result<Vec<LocatedItem>> {
    let screen = StaticScreenshot::new(&config.paths.screenshot).capture()?;
    item_locator(config).locate(&screen)
}

fn load_predictor<B: Backend>(config: &AppConfig, device: &B::Device) -> Result<Predictor<B>> {
    let index = IdentifierIndex::build_or_load(&config.paths.sample_store, &config.paths.index_file)?;
    Predictor::load(&config.paths.checkpoint, index, device)
}

fn log_predictions(predictions: &[Prediction]) {
    for (i, p) in predictions.iter().enumerate() {
        log::info!("[{:>2}] {:<12} {:.4}", i, p.identifier.as_str(), p.confidence);
    }
}

fn evaluate<B: Backend>(config: &AppConfig, device: &B::Device) -> Result<()> {
    let predictor = load_predictor::<B>(config, device)?;
    let items = locate_static_screenshot(config)?;
    let crops: Vec<_> = items.into_iter().map(|item| item.normalized).collect();
    log_predictions(&predictor.predict(&crops)?);
    Ok(())
}

fn curate<B: Backend>(config: &AppConfig, device: &B::Device) -> Result<()> {
    let predictor = load_predictor::<B>(config, device)?;
    let screen = AdbCapture::new(config.capture.adb_path.clone()).capture()?;

    let locator = item_locator(config);
    let stdin = std::io::stdin();
    let mut reviewer = TerminalReviewer::new(stdin.lock(), config.paths.review_preview.clone());
    let store = SampleStore::new(&config.paths.sample_store);

    let mut curation = CurationLoop::new(
        &predictor,
        &locator,
        &mut reviewer,
        store,
        config.curation.confidence_threshold,
    );
    let records = curation.process(&screen)?;

    let reviewed = records.iter().filter(|r| r.reviewed).count();
    let others = records.iter().filter(|r| r.stored_as.is_other()).count();
    log::info!(
        "{} 枚を保存しました（確認 {} 枚, other {} 枚）",
        records.len(),
        reviewed,
        others
    );
    Ok(())
}

fn export<B: Backend>(config: &AppConfig, device: &B::Device) -> Result<()> {
    let predictor = load_predictor::<B>(config, device)?;
    let items = locate_static_screenshot(config)?;
    if items.is_empty() {
        anyhow::bail!(
            "トレース用のアイテムがスクリーンショットにありません: {}",
            config.paths.screenshot.display()
        );
    }
    let crops: Vec<_> = items.into_iter().map(|item| item.normalized).collect();
    let trace = prediction::stack_crops(&crops)?;
    export_inference_graph(
        predictor.model(),
        &trace,
        predictor.index(),
        &config.paths.inference_graph,
        device,
    )?;
    Ok(())
}

fn evaluate_graph(config: &AppConfig) -> Result<()> {
    let predictor = GraphPredictor::load(&config.paths.inference_graph)?;
    let items = locate_static_screenshot(config)?;
    let crops: Vec<_> = items.into_iter().map(|item| item.normalized).collect();
    log_predictions(&predictor.predict(&crops)?);
    Ok(())
}
