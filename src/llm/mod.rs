pub mod client;

// Re-export commonly used types
pub use client::{CallRetry, ChatApi, ChatMessage, LlmError};
