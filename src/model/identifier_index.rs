//! アイテムID ↔ クラスインデックスの対応表
//!
//! 収集ディレクトリ直下のサブディレクトリ名がそのままアイテムIDになります。
//! ディレクトリ列挙順はOSに依存するため、名前を辞書順に並べてから
//! 0 から順にインデックスを振ります。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::PipelineError;

/// アイテムID
///
/// カタログのアイテムID（数字のみ）か、未知アイテムを表す `"other"`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemIdentifier(String);

impl ItemIdentifier {
    pub const OTHER: &'static str = "other";

    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn other() -> Self {
        Self(Self::OTHER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// カタログのアイテムIDか（空でなく、すべてASCII数字）
    pub fn is_catalog_id(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_ascii_digit())
    }

    pub fn is_other(&self) -> bool {
        self.0 == Self::OTHER
    }
}

impl fmt::Display for ItemIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemIdentifier {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// 永続化フォーマット `{idx2id: [...], id2idx: {...}}`
#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    idx2id: Vec<ItemIdentifier>,
    id2idx: BTreeMap<ItemIdentifier, usize>,
}

/// アイテムIDとクラスインデックスの全単射
///
/// 構築後は変更しない。
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierIndex {
    idx2id: Vec<ItemIdentifier>,
    id2idx: HashMap<ItemIdentifier, usize>,
}

impl IdentifierIndex {
    /// ID列から構築（重複は不可）
    pub fn from_identifiers(idx2id: Vec<ItemIdentifier>) -> Result<Self> {
        let mut id2idx = HashMap::with_capacity(idx2id.len());
        for (index, id) in idx2id.iter().enumerate() {
            if id2idx.insert(id.clone(), index).is_some() {
                anyhow::bail!("アイテムIDが重複しています: {}", id);
            }
        }
        Ok(Self { idx2id, id2idx })
    }

    /// 収集ディレクトリからインデックスを構築
    pub fn build(sample_store_root: &Path) -> Result<Self> {
        let mut names = Vec::new();
        let entries = fs::read_dir(sample_store_root)
            .with_context(|| format!("Failed to read sample store: {}", sample_store_root.display()))?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) => names.push(ItemIdentifier::new(name)),
                None => log::warn!("UTF-8でないディレクトリ名を無視します: {:?}", entry.file_name()),
            }
        }

        if names.is_empty() {
            return Err(PipelineError::EmptyCatalog {
                root: sample_store_root.to_path_buf(),
            }
            .into());
        }

        names.sort();
        Self::from_identifiers(names)
    }

    /// インデックスを構築してJSONに保存する
    pub fn build_and_save(sample_store_root: &Path, index_path: &Path) -> Result<Self> {
        let index = Self::build(sample_store_root)?;
        index.save(index_path)?;
        log::info!("クラス数: {} ({})", index.len(), index_path.display());
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let document = IndexDocument {
            idx2id: self.idx2id.clone(),
            id2idx: self.id2idx.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string(&document)?;
        fs::write(path, json).with_context(|| format!("Failed to write index: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read index: {}", path.display()))?;
        let document: IndexDocument = serde_json::from_str(&content)?;
        let index = Self::from_identifiers(document.idx2id)?;

        if document.id2idx.len() != index.len()
            || document
                .id2idx
                .iter()
                .any(|(id, &i)| index.index_of(id) != Some(i))
        {
            anyhow::bail!("idx2id と id2idx が一致しません: {}", path.display());
        }
        if index.is_empty() {
            return Err(PipelineError::EmptyCatalog { root: path.to_path_buf() }.into());
        }
        Ok(index)
    }

    /// 収集ディレクトリがあれば再構築し、なければ保存済みのファイルを読む
    pub fn build_or_load(sample_store_root: &Path, index_path: &Path) -> Result<Self> {
        if sample_store_root.is_dir() {
            Self::build(sample_store_root)
        } else {
            Self::load(index_path)
        }
    }

    pub fn len(&self) -> usize {
        self.idx2id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx2id.is_empty()
    }

    pub fn identifier(&self, index: usize) -> Option<&ItemIdentifier> {
        self.idx2id.get(index)
    }

    pub fn index_of(&self, id: &ItemIdentifier) -> Option<usize> {
        self.id2idx.get(id).copied()
    }

    pub fn identifiers(&self) -> &[ItemIdentifier] {
        &self.idx2id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn test_build_is_sorted_bijection() {
        let dir = make_store(&["other", "30012", "30013", "2001"]);
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let index = IdentifierIndex::build(dir.path()).unwrap();
        assert_eq!(index.len(), 4);
        let ids: Vec<&str> = index.identifiers().iter().map(|i| i.as_str()).collect();
        assert_eq!(ids, vec!["2001", "30012", "30013", "other"]);
        for i in 0..index.len() {
            assert_eq!(index.index_of(index.identifier(i).unwrap()), Some(i));
        }
    }

    #[test]
    fn test_empty_store_is_empty_catalog() {
        let dir = make_store(&[]);
        let err = IdentifierIndex::build(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EmptyCatalog { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = make_store(&["30012", "other"]);
        let out = tempfile::tempdir().unwrap();
        let index_path = out.path().join("meta").join("index.json");
        let built = IdentifierIndex::build_and_save(dir.path(), &index_path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&index_path).unwrap()).unwrap();
        assert_eq!(json["idx2id"], serde_json::json!(["30012", "other"]));
        assert_eq!(json["id2idx"]["other"], 1);

        let loaded = IdentifierIndex::load(&index_path).unwrap();
        assert_eq!(built, loaded);
    }

    #[test]
    fn test_load_rejects_inconsistent_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        fs::write(&path, r#"{"idx2id":["a","b"],"id2idx":{"a":1,"b":0}}"#).unwrap();
        assert!(IdentifierIndex::load(&path).is_err());
    }

    #[test]
    fn test_catalog_id() {
        assert!(ItemIdentifier::new("30012").is_catalog_id());
        assert!(!ItemIdentifier::other().is_catalog_id());
        assert!(!ItemIdentifier::new("").is_catalog_id());
        assert!(ItemIdentifier::other().is_other());
    }
}
