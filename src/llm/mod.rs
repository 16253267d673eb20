//! LLM 层：后端抽象（Gemini / Mock）、Key 轮换、会话句柄与带容错的客户端

pub mod client;
pub mod credentials;
pub mod gemini;
pub mod mock;
pub mod session;
pub mod traits;

pub use client::{
    CannedMessages, ClientOptions, ReplyOutcome, ResilientChatClient, REJECTED_WITHOUT_CODE,
};
pub use credentials::CredentialRotator;
pub use gemini::{GeminiBackend, GEMINI_BASE_URL};
pub use mock::{MockBackend, MockCall};
pub use session::{ConversationSession, SessionConfig};
pub use traits::{ChatBackend, ChatSession, LlmError, SafetyPolicy, SessionParams};
