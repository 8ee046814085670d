//! 目視確認

use anyhow::{Context, Result};
use image::RgbImage;
use std::io::BufRead;
use std::path::PathBuf;

use crate::model::ItemIdentifier;

/// 確認結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewKey {
    /// 予測どおりのアイテム
    Confirm,
    /// 予測が誤り（"other" として保存）
    Reject,
}

impl ReviewKey {
    /// 入力行を判定する。空行（Enter のみ）が確定、それ以外は却下
    pub fn from_line(line: &str) -> Self {
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            ReviewKey::Confirm
        } else {
            ReviewKey::Reject
        }
    }
}

/// 切り出しを人に見せて判定してもらう
pub trait Reviewer {
    fn review(&mut self, crop: &RgbImage, proposed: &ItemIdentifier, confidence: f32) -> Result<ReviewKey>;
}

/// プレビュー画像を書き出し、端末で1行入力を待つ
pub struct TerminalReviewer<R: BufRead> {
    input: R,
    preview_path: PathBuf,
}

impl<R: BufRead> TerminalReviewer<R> {
    pub fn new(input: R, preview_path: PathBuf) -> Self {
        Self { input, preview_path }
    }
}

impl<R: BufRead> Reviewer for TerminalReviewer<R> {
    fn review(&mut self, crop: &RgbImage, proposed: &ItemIdentifier, confidence: f32) -> Result<ReviewKey> {
        if let Some(parent) = self.preview_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        crop.save(&self.preview_path)
            .with_context(|| format!("プレビューを保存できません: {}", self.preview_path.display()))?;

        log::info!(
            "予測: {} (信頼度 {:.3})  プレビュー: {}  [Enter で確定 / 他の入力で other]",
            proposed,
            confidence,
            self.preview_path.display()
        );

        let mut line = String::new();
        let read = self.input.read_line(&mut line)?;
        if read == 0 {
            // 入力の終端
            return Ok(ReviewKey::Reject);
        }
        Ok(ReviewKey::from_line(&line))
    }
}
