//! 对话历史持久化
//!
//! 单文件 JSON：`{"version": 1, "history": [...]}`，history 为后端原生记录原样序列化。
//! 写入先落临时文件再 rename，进程崩溃时只会留下旧文件或新文件，不会留下半截内容。

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::StoreError;
use crate::memory::ConversationHistory;

const HISTORY_VERSION: u32 = 1;

#[derive(Deserialize)]
struct HistoryBlob {
    version: u32,
    history: ConversationHistory,
}

#[derive(Serialize)]
struct HistoryBlobRef<'a> {
    version: u32,
    history: &'a ConversationHistory,
}

/// 历史文件存储；文件不存在视为首次启动
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取历史；文件不存在时返回 None
    pub fn load(&self) -> Result<Option<ConversationHistory>, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob: HistoryBlob = serde_json::from_str(&data)?;
        if blob.version != HISTORY_VERSION {
            return Err(StoreError::UnsupportedVersion(blob.version));
        }
        Ok(Some(blob.history))
    }

    /// 整体覆盖写入；父目录不存在时自动创建
    pub fn save(&self, history: &ConversationHistory) -> Result<(), StoreError> {
        let blob = HistoryBlobRef {
            version: HISTORY_VERSION,
            history,
        };
        write_atomic(&self.path, serde_json::to_string(&blob)?.as_bytes())?;
        Ok(())
    }

    /// 从最旧端成对剪枝到 max_len 以内，返回删除条数
    pub fn truncate(history: &mut ConversationHistory, max_len: usize) -> usize {
        history.truncate(max_len)
    }
}

/// 写临时文件 + rename 覆盖目标
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("history.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested/cache/history.json"));
        let history = ConversationHistory::from_records(vec![
            json!({ "role": "user", "parts": [{ "text": "こんにちは" }] }),
            json!({ "role": "model", "parts": [{ "text": "やあ", "thought": false }] }),
        ]);

        store.save(&history).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, history);
        // 临时文件已被 rename 掉
        assert!(!dir.path().join("nested/cache/history.json.tmp").exists());
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("history.json"));
        let mut history = ConversationHistory::new();
        history.push(json!({ "role": "user", "parts": [] }));
        history.push(json!({ "role": "model", "parts": [] }));
        store.save(&history).unwrap();

        history.clear();
        store.save(&history).unwrap();
        assert!(store.load().unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_version_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, r#"{"version": 99, "history": []}"#).unwrap();
        let err = SessionStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion(99)));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            SessionStore::new(&path).load(),
            Err(StoreError::Json(_))
        ));
    }
}
