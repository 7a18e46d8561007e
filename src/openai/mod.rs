//! OpenAI 兼容接口层

pub mod handler;
pub mod types;
