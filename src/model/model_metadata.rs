//! モデルメタデータの定義
//!
//! チェックポイント（tar.gz）に `metadata.json` として同梱されます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::identifier_index::ItemIdentifier;

/// チェックポイントのメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// 出力クラス数（学習時のインデックスの長さで固定）
    pub num_classes: usize,

    /// 学習時の idx2id
    pub idx2id: Vec<ItemIdentifier>,

    /// モデル入力サイズ（64x64）
    pub model_input_size: u32,

    /// 学習ステップ数
    pub steps: usize,

    /// 学習率
    pub learning_rate: f64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    pub fn new(idx2id: Vec<ItemIdentifier>, model_input_size: u32, steps: usize, learning_rate: f64) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            num_classes: idx2id.len(),
            idx2id,
            model_input_size,
            steps,
            learning_rate,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

/// メタデータをログに出す
pub fn print_metadata_info(metadata: &ModelMetadata) {
    log::info!("クラス数: {}", metadata.num_classes);
    log::info!(
        "クラス: {}",
        metadata
            .idx2id
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    log::info!("モデル入力サイズ: {}x{}", metadata.model_input_size, metadata.model_input_size);
    log::info!("学習ステップ数: {} (学習率 {})", metadata.steps, metadata.learning_rate);
    log::info!("学習日時: {}", metadata.trained_at);
}
