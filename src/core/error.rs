//! 持久化与凭据错误类型
//!
//! 后端调用错误见 `llm::LlmError`；这里只放本地状态（历史文件、Key 下标）相关的错误。

use thiserror::Error;

/// 历史文件读写错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported history version: {0}")]
    UnsupportedVersion(u32),
}

/// API Key 配置错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CredentialError {
    #[error("No API keys configured")]
    NoCredentials,

    #[error("Credential index {index} out of range ({count} keys)")]
    OutOfRange { index: usize, count: usize },
}
