//! パイプライン全体で使うエラー種別
//!
//! 関数の戻り値は `anyhow::Result` で統一し、呼び出し側が種別で分岐したい
//! 場合は `downcast_ref::<PipelineError>()` で取り出します。

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// 収集画像がデコードできない（サンプル単位でスキップされる）
    Decode { path: PathBuf, message: String },
    /// 円形マーカーが1つも検出されなかった
    NoMarkerDetected { path: PathBuf },
    /// 収集ディレクトリにクラスが1つもない
    EmptyCatalog { root: PathBuf },
    /// チェックポイントのクラス数が現在のインデックスと一致しない
    CheckpointShapeMismatch { expected: usize, found: usize },
    /// クラス数は同じだが、あるインデックスのアイテムIDが異なる
    CheckpointLabelMismatch {
        position: usize,
        expected: String,
        found: String,
    },
    /// スクリーンショットが取得できない
    CaptureFailure(String),
    /// 切り出し範囲が画像の外にはみ出している
    CropOutOfBounds {
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        width: u32,
        height: u32,
    },
    /// インデックスに存在しないアイテムID
    UnknownIdentifier(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Decode { path, message } => {
                write!(f, "画像のデコードに失敗しました: {} ({})", path.display(), message)
            }
            PipelineError::NoMarkerDetected { path } => {
                write!(f, "円形マーカーが検出されませんでした: {}", path.display())
            }
            PipelineError::EmptyCatalog { root } => {
                write!(f, "アイテムディレクトリが1つもありません: {}", root.display())
            }
            PipelineError::CheckpointShapeMismatch { expected, found } => write!(
                f,
                "チェックポイントのクラス数が一致しません: 期待 {}, 実際 {}",
                expected, found
            ),
            PipelineError::CheckpointLabelMismatch { position, expected, found } => write!(
                f,
                "チェックポイントのクラス {} のアイテムIDが一致しません: 期待 {}, 実際 {}",
                position, expected, found
            ),
            PipelineError::CaptureFailure(reason) => {
                write!(f, "スクリーンショットの取得に失敗しました: {}", reason)
            }
            PipelineError::CropOutOfBounds { x1, y1, x2, y2, width, height } => write!(
                f,
                "切り出し範囲 ({}, {})-({}, {}) が画像サイズ {}x{} の外にあります",
                x1, y1, x2, y2, width, height
            ),
            PipelineError::UnknownIdentifier(id) => {
                write!(f, "インデックスに存在しないアイテムIDです: {}", id)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = PipelineError::CheckpointShapeMismatch { expected: 3, found: 5 }.into();
        let err = err.context("チェックポイント読み込み");
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::CheckpointShapeMismatch { expected: 3, found: 5 })
        );
    }
}
