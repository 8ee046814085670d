//! アイテムアイコン認識ツール
//!
//! 使い方: `inventory_recognizer [train|evaluate|curate|export|evaluate-graph]`（省略時は train）

use inventory_recognizer_lib::commands::{self, Mode};
use inventory_recognizer_lib::model::AppConfig;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mode = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<Mode>()?,
        None => Mode::default(),
    };

    let config = AppConfig::load_or_default();
    commands::run(mode, &config)
}
