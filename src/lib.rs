pub mod error;
pub mod model;
pub mod ml;
pub mod screen;
pub mod curation;

// 実行モード（Burn バックエンドが必要）
#[cfg(feature = "ml")]
pub mod commands;

pub use error::PipelineError;
