//! tar.gz バンドルの読み書き
//!
//! チェックポイント:
//! - metadata.json   - メタデータ（クラス数、idx2id など）
//! - model.bin       - モデルの重み（Burn バイナリレコード）
//!
//! 推論グラフ:
//! - metadata.json   - グラフのメタデータ（idx2id、トレース形状）
//! - model.onnx      - ONNX モデル

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const MODEL_ENTRY: &str = "model.bin";
pub const GRAPH_ENTRY: &str = "model.onnx";

/// 拡張子が `.gz` でなければ `.tar.gz` を付ける
pub fn bundle_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// 名前付きエントリを1つの tar.gz に書き込む
pub fn write_bundle(output_path: &Path, entries: &[(&str, &[u8])]) -> Result<PathBuf> {
    let tar_gz_path = bundle_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(name)?;
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder
            .append(&header, *bytes)
            .context(format!("Failed to add {} to tar", name))?;
    }

    // gzip ストリームまで確実に閉じる
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    Ok(tar_gz_path)
}

/// tar.gz から指定したエントリをすべて読み込む
pub fn read_bundle(tar_gz_path: &Path, names: &[&str]) -> Result<HashMap<String, Vec<u8>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);
    let mut found = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        let Some(name) = path.to_str().map(|s| s.to_string()) else {
            continue;
        };
        if names.contains(&name.as_str()) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found.insert(name, buffer);
        }
    }

    for name in names {
        if !found.contains_key(*name) {
            anyhow::bail!("{} not found in tar.gz archive: {:?}", name, tar_gz_path);
        }
    }

    Ok(found)
}

/// メタデータと共にモデルをTar.gz形式で保存
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let json_str = metadata.to_json_string()?;
    write_bundle(
        output_path,
        &[(METADATA_ENTRY, json_str.as_bytes()), (MODEL_ENTRY, model_binary)],
    )
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_bundle(tar_gz_path, &[METADATA_ENTRY])?;
    let json = entries.remove(METADATA_ENTRY).unwrap_or_default();
    ModelMetadata::from_json_string(&String::from_utf8(json)?)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut entries = read_bundle(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?;
    let json = entries.remove(METADATA_ENTRY).unwrap_or_default();
    let metadata = ModelMetadata::from_json_string(&String::from_utf8(json)?)?;
    let binary = entries.remove(MODEL_ENTRY).unwrap_or_default();
    Ok((metadata, binary))
}
