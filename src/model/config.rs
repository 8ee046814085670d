//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、パス、学習スケジュール、データ拡張などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// ファイル・ディレクトリのパス
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// 収集画像のルート（`<root>/<アイテムID>/<ミリ秒>.png`）
    pub sample_store: PathBuf,
    /// アイテムID ↔ インデックス対応表
    pub index_file: PathBuf,
    /// チェックポイント（tar.gz）
    pub checkpoint: PathBuf,
    /// 推論グラフ（tar.gz）
    pub inference_graph: PathBuf,
    /// 評価・エクスポートに使う静的スクリーンショット
    pub screenshot: PathBuf,
    /// 学習ログ（CSV）
    pub training_log: PathBuf,
    /// 目視確認用のプレビュー画像
    pub review_preview: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            sample_store: PathBuf::from("images/collect"),
            index_file: PathBuf::from("index_itemid_relation.json"),
            checkpoint: PathBuf::from("models/item_classifier.tar.gz"),
            inference_graph: PathBuf::from("models/item_classifier_graph.tar.gz"),
            screenshot: PathBuf::from("images/screen.png"),
            training_log: PathBuf::from("models/training_log.csv"),
            review_preview: PathBuf::from("images/review.png"),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 最適化ステップ数（毎ステップ新しいバッチを生成）
    pub steps: usize,
    /// 学習率 (Adam)
    pub learning_rate: f64,
    /// バッチのシャッフル用シード（毎回同じ順列になる）
    pub shuffle_seed: u64,
    /// 位置ジッターのシード。`None` なら毎回異なる切り出しになる
    pub jitter_seed: Option<u64>,
    /// 最初の何ステップを毎回ログ出力するか
    pub log_first_steps: usize,
    /// 以降のログ出力間隔
    pub log_every: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            steps: 300,
            learning_rate: 1e-3,
            shuffle_seed: 321,
            jitter_seed: None,
            log_first_steps: 10,
            log_every: 10,
        }
    }
}

impl TrainingSettings {
    /// このステップをログ出力するか
    pub fn should_log(&self, step: usize) -> bool {
        step < self.log_first_steps || (self.log_every > 0 && step % self.log_every == 0)
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentSettings {
    /// 読み込み時のリサイズ後サイズ（正方形）
    pub sample_size: u32,
    /// カタログアイテム1枚あたりの切り出し数
    pub item_crops: usize,
    /// それ以外（"other"）1枚あたりの切り出し数
    pub other_crops: usize,
    /// 中心座標のジッター幅: 各軸 [-jitter, jitter) の整数
    pub jitter: i32,
    /// マーカー検出の最小半径
    pub marker_min_radius: u32,
    /// マーカー検出の最大半径
    pub marker_max_radius: u32,
}

impl Default for AugmentSettings {
    fn default() -> Self {
        Self {
            sample_size: 128,
            item_crops: 10,
            other_crops: 1,
            jitter: 3,
            marker_min_radius: 50,
            marker_max_radius: 100,
        }
    }
}

/// 収集（目視確認）設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationSettings {
    /// この値未満の信頼度は確認なしで "other" に保存する
    pub confidence_threshold: f32,
}

impl Default for CurationSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.1,
        }
    }
}

/// 画面からアイテム領域を探す設定
///
/// 720p 前後の画面を想定しています。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorSettings {
    /// 検出前にこの高さへ拡大縮小する
    pub reference_height: u32,
    pub min_radius: u32,
    pub max_radius: u32,
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            reference_height: 720,
            min_radius: 50,
            max_radius: 100,
        }
    }
}

/// スクリーンショット取得設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// adb 実行ファイル
    pub adb_path: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub paths: PathSettings,
    pub training: TrainingSettings,
    pub augment: AugmentSettings,
    pub curation: CurationSettings,
    pub locator: LocatorSettings,
    pub capture: CaptureSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    log::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出す
    pub fn display(&self) {
        log::info!("計算デバイス: {}", self.device_type);
        log::info!("収集ディレクトリ: {}", self.paths.sample_store.display());
        log::info!("チェックポイント: {}", self.paths.checkpoint.display());
        log::info!(
            "学習: {} ステップ, 学習率 {}, シャッフルシード {}",
            self.training.steps,
            self.training.learning_rate,
            self.training.shuffle_seed
        );
        log::info!(
            "拡張: アイテム {} 枚 / other {} 枚, ジッター ±{}",
            self.augment.item_crops,
            self.augment.other_crops,
            self.augment.jitter
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.steps, 300);
        assert_eq!(config.training.shuffle_seed, 321);
        assert_eq!(config.training.jitter_seed, None);
        assert_eq!(config.augment.item_crops, 10);
        assert_eq!(config.augment.other_crops, 1);
        assert_eq!(config.curation.confidence_threshold, 0.1);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.paths.checkpoint, deserialized.paths.checkpoint);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"device_type":"Cpu","training":{"steps":5}}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.steps, 5);
        assert_eq!(config.training.learning_rate, 1e-3);
        assert_eq!(config.augment.sample_size, 128);
    }

    #[test]
    fn test_log_cadence() {
        let training = TrainingSettings::default();
        let logged: Vec<usize> = (0..35).filter(|&s| training.should_log(s)).collect();
        assert_eq!(logged, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 30]);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
