//! Fuyuka - 直播 AI 主持人中继
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 消息模型、旁白合批、分发、应用上下文、优雅关闭
//! - **gateway**: 广播中枢与 HTTP / WebSocket 服务
//! - **llm**: 后端抽象（Gemini / Mock）、Key 轮换、会话句柄、带容错的客户端
//! - **memory**: 对话历史与持久化
//! - **observability**: tracing 日志初始化
//! - **text**: HTML 清洗与提示词文件读取

pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod text;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::AppContext;
