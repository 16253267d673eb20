//! 记忆层：对话历史（后端原生记录）与其持久化

pub mod history;
pub mod persistence;

pub use history::{ConversationHistory, HistoryRecord};
pub use persistence::SessionStore;
pub(crate) use persistence::write_atomic;
