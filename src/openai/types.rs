//! OpenAI 兼容 API 类型定义

use chrono::Utc;
use serde::{Deserialize, Serialize};

// === 错误响应 ===

/// API 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// 错误详情
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    /// 创建新的错误响应
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }

    /// 创建认证错误响应
    pub fn authentication_error() -> Self {
        Self::new("authentication_error", "Invalid API key")
    }
}

// === Models 端点类型 ===

/// 模型信息
#[derive(Debug, Serialize)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// 模型列表响应
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<Model>,
}

// === Chat Completions 请求类型 ===

/// Chat Completions 请求体
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// 消息
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    /// 可以是 string 或内容分块数组
    pub content: serde_json::Value,
}

/// 种子素材类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    Image,
    Video,
}

/// 从消息中提取到的种子素材引用
#[derive(Debug, Clone)]
pub struct SeedMedia {
    pub kind: SeedKind,
    pub url: String,
}

/// 从最后一条消息解析出的生成请求内容
#[derive(Debug, Clone)]
pub struct ParsedPrompt {
    pub prompt: String,
    pub seed_media: Option<SeedMedia>,
}

impl ChatRequest {
    /// 解析最后一条消息：拼接文本分块为提示词，提取第一个图像/视频引用
    ///
    /// content 可以是纯字符串，或 `{type: text|image_url|video_url, ...}` 分块数组
    pub fn parse_prompt(&self) -> Result<ParsedPrompt, String> {
        let last = self
            .messages
            .last()
            .ok_or_else(|| "messages 不能为空".to_string())?;

        if let Some(text) = last.content.as_str() {
            let prompt = text.trim().to_string();
            if prompt.is_empty() {
                return Err("提示词不能为空".to_string());
            }
            return Ok(ParsedPrompt {
                prompt,
                seed_media: None,
            });
        }

        let Some(parts) = last.content.as_array() else {
            return Err("content 必须是字符串或分块数组".to_string());
        };

        let mut texts: Vec<&str> = Vec::new();
        let mut seed_media = None;
        for part in parts {
            match part.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        texts.push(text);
                    }
                }
                Some("image_url") => {
                    if seed_media.is_none() {
                        if let Some(url) = part
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(|u| u.as_str())
                        {
                            seed_media = Some(SeedMedia {
                                kind: SeedKind::Image,
                                url: url.to_string(),
                            });
                        }
                    }
                }
                Some("video_url") => {
                    if seed_media.is_none() {
                        if let Some(url) = part
                            .get("video_url")
                            .and_then(|v| v.get("url"))
                            .and_then(|u| u.as_str())
                        {
                            seed_media = Some(SeedMedia {
                                kind: SeedKind::Video,
                                url: url.to_string(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        let prompt = texts.join("\n").trim().to_string();
        if prompt.is_empty() {
            return Err("提示词不能为空".to_string());
        }
        Ok(ParsedPrompt { prompt, seed_media })
    }
}

// === Chat Completions 响应帧类型 ===

/// 流式增量内容
#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// 流式帧的单个选择
#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// 流式进度帧（chat.completion.chunk）
///
/// 成功与失败的终止帧使用同一种帧结构，只是 content 内容不同；
/// finish_reason 非空表示该帧是此请求的最后一帧
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// 创建进度帧
    pub fn progress(request_id: &str, model: &str, content: impl Into<String>) -> Self {
        Self::build(request_id, model, Some(content.into()), None)
    }

    /// 创建终止帧（成功或失败均使用相同帧结构）
    pub fn terminal(request_id: &str, model: &str, content: impl Into<String>) -> Self {
        Self::build(request_id, model, Some(content.into()), Some("stop".to_string()))
    }

    fn build(
        request_id: &str,
        model: &str,
        content: Option<String>,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: format!("chatcmpl-{}", request_id),
            object: "chat.completion.chunk".to_string(),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: Some("assistant".to_string()),
                    content,
                },
                finish_reason,
            }],
        }
    }

    /// 是否为终止帧
    pub fn is_terminal(&self) -> bool {
        self.choices
            .first()
            .map(|c| c.finish_reason.is_some())
            .unwrap_or(false)
    }

    /// 帧携带的文本内容
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .unwrap_or("")
    }
}

/// 非流式响应的消息体
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

/// 非流式响应的单个选择
#[derive(Debug, Clone, Serialize)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

/// 非流式响应（chat.completion）
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
}

impl ChatCompletionResponse {
    /// 由终止帧转换为非流式响应
    pub fn from_terminal_chunk(chunk: &ChatCompletionChunk) -> Self {
        Self {
            id: chunk.id.clone(),
            object: "chat.completion".to_string(),
            created: chunk.created,
            model: chunk.model.clone(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: chunk.content().to_string(),
                },
                finish_reason: chunk
                    .choices
                    .first()
                    .and_then(|c| c.finish_reason.clone()),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试纯文本 content 解析
    #[test]
    fn test_parse_plain_text_content() {
        let json = r#"{
            "model": "pix-image",
            "messages": [{"role": "user", "content": "一只在月球上的猫"}]
        }"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert!(req.stream); // 默认流式

        let parsed = req.parse_prompt().unwrap();
        assert_eq!(parsed.prompt, "一只在月球上的猫");
        assert!(parsed.seed_media.is_none());
    }

    /// 测试分块数组 content 解析（文本 + 图像引用）
    #[test]
    fn test_parse_parts_with_image() {
        let json = r#"{
            "model": "pix-video",
            "stream": false,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "让画面动起来"},
                    {"type": "image_url", "image_url": {"url": "https://img.example.com/a.png"}}
                ]
            }]
        }"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert!(!req.stream);

        let parsed = req.parse_prompt().unwrap();
        assert_eq!(parsed.prompt, "让画面动起来");
        let seed = parsed.seed_media.unwrap();
        assert_eq!(seed.kind, SeedKind::Image);
        assert_eq!(seed.url, "https://img.example.com/a.png");
    }

    /// 测试视频引用分块
    #[test]
    fn test_parse_parts_with_video() {
        let json = r#"{
            "model": "pix-video",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "续写这段视频"},
                    {"type": "video_url", "video_url": {"url": "https://v.example.com/b.mp4"}}
                ]
            }]
        }"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        let parsed = req.parse_prompt().unwrap();
        assert_eq!(parsed.seed_media.unwrap().kind, SeedKind::Video);
    }

    /// 测试多条消息时只解析最后一条
    #[test]
    fn test_parse_uses_last_message() {
        let json = r#"{
            "model": "pix-image",
            "messages": [
                {"role": "user", "content": "第一条"},
                {"role": "assistant", "content": "好的"},
                {"role": "user", "content": "第二条"}
            ]
        }"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.parse_prompt().unwrap().prompt, "第二条");
    }

    /// 测试空消息与空提示词报错
    #[test]
    fn test_parse_empty_errors() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"model": "pix-image", "messages": []}"#,
        )
        .unwrap();
        assert!(req.parse_prompt().is_err());

        let req: ChatRequest = serde_json::from_str(
            r#"{"model": "pix-image", "messages": [{"role": "user", "content": "  "}]}"#,
        )
        .unwrap();
        assert!(req.parse_prompt().is_err());
    }

    /// 测试终止帧判定与非流式转换
    #[test]
    fn test_terminal_chunk_and_response() {
        let progress = ChatCompletionChunk::progress("req-1", "pix-image", "生成中");
        assert!(!progress.is_terminal());

        let terminal =
            ChatCompletionChunk::terminal("req-1", "pix-image", "https://cdn.example.com/x.png");
        assert!(terminal.is_terminal());

        let response = ChatCompletionResponse::from_terminal_chunk(&terminal);
        assert_eq!(response.object, "chat.completion");
        assert_eq!(
            response.choices[0].message.content,
            "https://cdn.example.com/x.png"
        );
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    /// 测试流式帧序列化形状（delta 字段、chunk 对象类型）
    #[test]
    fn test_chunk_wire_shape() {
        let chunk = ChatCompletionChunk::progress("req-2", "pix-video", "排队中");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["delta"]["content"], "排队中");
        assert!(json["choices"][0]["finish_reason"].is_null());
        assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
    }
}
