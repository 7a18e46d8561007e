//! API Key 认证工具

use axum::body::Body;
use axum::http::Request;
use subtle::ConstantTimeEq;

/// 从请求中提取 API Key
///
/// 依次检查 `Authorization: Bearer <key>` 和 `x-api-key` 头
pub fn extract_api_key(request: &Request<Body>) -> Option<String> {
    if let Some(auth) = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(key) = auth.strip_prefix("Bearer ") {
            return Some(key.trim().to_string());
        }
    }

    request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

/// 常量时间字符串比较，防止时序攻击
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
