//! 核心层：消息模型、旁白合批、分发、应用上下文与关闭处理

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod narration;
pub mod shutdown;
pub mod turn;

pub use context::{AppContext, PromptTexts};
pub use dispatcher::Dispatcher;
pub use error::{CredentialError, StoreError};
pub use narration::NarrationAggregator;
pub use shutdown::{
    HistoryCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use turn::{ChatTurn, Turn};
