//! スクリーンショットの取得

use anyhow::Result;
use image::RgbImage;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::PipelineError;

/// 画面画像の取得元
pub trait ScreenCapture {
    fn capture(&self) -> Result<RgbImage>;
}

/// 保存済みのスクリーンショットを読む
#[derive(Debug, Clone)]
pub struct StaticScreenshot {
    pub path: PathBuf,
}

impl StaticScreenshot {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl ScreenCapture for StaticScreenshot {
    fn capture(&self) -> Result<RgbImage> {
        let image = image::open(&self.path).map_err(|e| {
            PipelineError::CaptureFailure(format!("{} を読み込めません: {}", self.path.display(), e))
        })?;
        Ok(image.to_rgb8())
    }
}

/// `adb exec-out screencap -p` で端末の画面を取得する
#[derive(Debug, Clone)]
pub struct AdbCapture {
    pub adb_path: String,
}

impl AdbCapture {
    pub fn new<S: Into<String>>(adb_path: S) -> Self {
        Self { adb_path: adb_path.into() }
    }
}

impl ScreenCapture for AdbCapture {
    fn capture(&self) -> Result<RgbImage> {
        let output = Command::new(&self.adb_path)
            .args(["exec-out", "screencap", "-p"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PipelineError::CaptureFailure(format!("{} を実行できません: {}", self.adb_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::CaptureFailure(format!(
                "screencap が失敗しました ({}): {}",
                output.status,
                stderr.trim()
            ))
            .into());
        }
        log::debug!("screencap: {} bytes", output.stdout.len());

        let bytes = if cfg!(windows) {
            normalize_line_endings(&output.stdout)
        } else {
            output.stdout
        };
        decode_screencap(&bytes)
    }
}

/// CRLF を LF に戻す
///
/// Windows ホストでは exec-out の出力中の LF が CRLF に変換されていることがある。
pub fn normalize_line_endings(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            out.push(b'\n');
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

/// screencap の出力（PNG）をデコードする
pub fn decode_screencap(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(PipelineError::CaptureFailure("出力が空です".to_string()).into());
    }
    let image = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::CaptureFailure(format!("画像をデコードできません: {}", e)))?;
    Ok(image.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        RgbImage::from_pixel(4, 3, Rgb([1, 2, 3]))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings(b"a\r\nb\rc\r\n"), b"a\nb\rc\n".to_vec());
        assert_eq!(normalize_line_endings(b""), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_screencap() {
        let image = decode_screencap(&png_bytes()).unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_empty_or_garbage_output_is_capture_failure() {
        for bytes in [&b""[..], &b"error: no devices/emulators found"[..]] {
            let err = decode_screencap(bytes).unwrap_err();
            assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::CaptureFailure(_))));
        }
    }

    #[test]
    fn test_static_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.png");
        std::fs::write(&path, png_bytes()).unwrap();
        assert_eq!(StaticScreenshot::new(&path).capture().unwrap().dimensions(), (4, 3));

        let missing = StaticScreenshot::new(dir.path().join("missing.png"));
        let err = missing.capture().unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::CaptureFailure(_))));
    }
}
