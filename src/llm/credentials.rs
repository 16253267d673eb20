//! API Key 轮换
//!
//! 有序的 Key 列表加一个当前下标；下标持久化到单独的文本文件，重启后从上次停下的 Key 继续。
//! 日志里只出现下标，不出现 Key 本身。

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::core::CredentialError;
use crate::memory::write_atomic;

/// Key 轮换器：advance 按 (i + 1) % N 前进并落盘
#[derive(Debug)]
pub struct CredentialRotator {
    secrets: Vec<String>,
    index: Mutex<usize>,
    path: PathBuf,
}

impl CredentialRotator {
    /// Key 列表为空返回 NoCredentials；持久化下标缺失、无法解析或越界时从 0 开始
    pub fn new(secrets: Vec<String>, path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        if secrets.is_empty() {
            return Err(CredentialError::NoCredentials);
        }
        let path = path.as_ref().to_path_buf();
        let index = load_index(&path, secrets.len());
        info!(count = secrets.len(), index, "credential rotator ready");
        Ok(Self {
            secrets,
            index: Mutex::new(index),
            path,
        })
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn current_index(&self) -> usize {
        *self.lock()
    }

    /// 当前下标对应的 Key
    pub fn current(&self) -> (usize, &str) {
        let index = self.current_index();
        (index, self.secrets[index].as_str())
    }

    /// 前进到下一个 Key 并持久化；写盘失败只记日志，内存中的下标照常前进
    pub fn advance(&self) -> usize {
        let mut index = self.lock();
        let previous = *index;
        let next = (previous + 1) % self.secrets.len();
        if let Err(e) = write_atomic(&self.path, next.to_string().as_bytes()) {
            error!(path = %self.path.display(), error = %e, "failed to persist credential index");
        }
        *index = next;
        warn!(from = previous, to = next, "rotated API key");
        next
    }

    pub fn get(&self, index: usize) -> Result<&str, CredentialError> {
        self.secrets
            .get(index)
            .map(String::as_str)
            .ok_or(CredentialError::OutOfRange {
                index,
                count: self.secrets.len(),
            })
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_index(path: &Path, count: usize) -> usize {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "failed to read credential index, starting at 0"
            );
            return 0;
        }
    };
    match raw.trim().parse::<usize>() {
        Ok(i) if i < count => i,
        Ok(i) => {
            warn!(index = i, count, "persisted credential index out of range, starting at 0");
            0
        }
        Err(e) => {
            warn!(value = %raw.trim(), error = %e, "invalid credential index, starting at 0");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{i}")).collect()
    }

    #[test]
    fn test_empty_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CredentialRotator::new(vec![], dir.path().join("idx.txt")).unwrap_err();
        assert_eq!(err, CredentialError::NoCredentials);
    }

    #[test]
    fn test_advance_wraps_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache/idx.txt");
        let rotator = CredentialRotator::new(keys(3), &path).unwrap();
        assert_eq!(rotator.current_index(), 0);

        assert_eq!(rotator.advance(), 1);
        assert_eq!(rotator.advance(), 2);
        assert_eq!(rotator.advance(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");

        rotator.advance();
        let reopened = CredentialRotator::new(keys(3), &path).unwrap();
        assert_eq!(reopened.current_index(), 1);
        assert_eq!(reopened.current(), (1, "key-1"));
    }

    #[test]
    fn test_out_of_range_persisted_index_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.txt");
        std::fs::write(&path, "7").unwrap();
        let rotator = CredentialRotator::new(keys(2), &path).unwrap();
        assert_eq!(rotator.current_index(), 0);
    }

    #[test]
    fn test_garbage_persisted_index_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.txt");
        std::fs::write(&path, "not a number").unwrap();
        let rotator = CredentialRotator::new(keys(2), &path).unwrap();
        assert_eq!(rotator.current_index(), 0);
    }

    #[test]
    fn test_get_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = CredentialRotator::new(keys(2), dir.path().join("idx.txt")).unwrap();
        assert_eq!(rotator.get(1).unwrap(), "key-1");
        assert_eq!(
            rotator.get(2).unwrap_err(),
            CredentialError::OutOfRange { index: 2, count: 2 }
        );
    }

    #[test]
    fn test_advance_moves_on_when_index_file_is_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let rotator = CredentialRotator::new(keys(3), blocker.join("idx.txt")).unwrap();

        assert_eq!(rotator.advance(), 1);
        assert_eq!(rotator.current(), (1, "key-1"));
        assert_eq!(rotator.advance(), 2);
    }

    #[test]
    fn test_single_key_advance_stays_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = CredentialRotator::new(keys(1), dir.path().join("idx.txt")).unwrap();
        assert_eq!(rotator.advance(), 0);
    }
}
