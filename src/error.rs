//! 网关错误分类
//!
//! 四类结果：容量耗尽（可重试，不算任务失败）、客户端错误（不重试）、
//! 上游错误（任务失败）、内部错误（不允许被吞掉）。

use std::fmt;

use http::StatusCode;

/// 上游生成 API 的类型化错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// 请求超时（上游生成可能耗时数分钟，超过客户端超时仍算超时）
    Timeout,
    /// 凭据被拒绝（401/403）
    Unauthorized,
    /// 上游限流（429）
    RateLimited,
    /// 响应格式不符合预期
    InvalidResponse(String),
    /// 网络传输层错误
    Transport(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "上游请求超时"),
            Self::Unauthorized => write!(f, "凭据被上游拒绝"),
            Self::RateLimited => write!(f, "上游已限流"),
            Self::InvalidResponse(msg) => write!(f, "上游响应格式错误: {}", msg),
            Self::Transport(msg) => write!(f, "上游网络错误: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// 请求处理的顶层错误
#[derive(Debug)]
pub enum GatewayError {
    /// 所有启用凭据均已达并发上限——可重试的背压信号，不是任务失败
    NoCapacity,
    /// 客户端错误（未知模型、请求格式错误），不消耗上游调用
    Client(String),
    /// 上游调用失败
    Upstream(UpstreamError),
    /// 未预期的内部故障
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCapacity => write!(f, "所有凭据并发额度已用尽，请稍后重试"),
            Self::Client(msg) => write!(f, "{}", msg),
            Self::Upstream(e) => write!(f, "{}", e),
            Self::Internal(msg) => write!(f, "内部错误: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<UpstreamError> for GatewayError {
    fn from(e: UpstreamError) -> Self {
        Self::Upstream(e)
    }
}

impl GatewayError {
    /// 对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            Self::Client(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(UpstreamError::Unauthorized) => StatusCode::BAD_GATEWAY,
            Self::Upstream(UpstreamError::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(UpstreamError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 写入 RequestLog 的状态标签
    pub fn log_status(&self) -> &'static str {
        match self {
            Self::NoCapacity => "no_capacity",
            Self::Client(_) => "client_error",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }
}
