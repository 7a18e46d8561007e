//! 上游生成 API 客户端
//!
//! `UpstreamClient` 是能力接口：编排器与调度器只依赖该 trait，
//! 测试中可注入确定性的替身，不需要真实网络。本层不做重试，
//! 重试策略由编排器决定。

pub mod client;

use async_trait::async_trait;
use bytes::Bytes;

use crate::catalog::Orientation;
use crate::error::UpstreamError;
use crate::token::Credential;

pub use client::{HttpUpstreamClient, ProxyPool};

/// 上游生成 API 的能力接口
///
/// 每个生成操作接收提示词、可选种子素材、凭据与画幅参数，
/// 返回生成产物的 URL；失败以类型化的 [`UpstreamError`] 表示
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// 文生图
    async fn generate_image(
        &self,
        prompt: &str,
        credential: &Credential,
        width: u32,
        height: u32,
    ) -> Result<String, UpstreamError>;

    /// 图生图
    async fn generate_image_from_image(
        &self,
        prompt: &str,
        seed: Bytes,
        credential: &Credential,
        width: u32,
        height: u32,
    ) -> Result<String, UpstreamError>;

    /// 文生视频
    async fn generate_video(
        &self,
        prompt: &str,
        credential: &Credential,
        orientation: Orientation,
        duration_frames: u32,
    ) -> Result<String, UpstreamError>;

    /// 图生视频
    async fn generate_video_from_image(
        &self,
        prompt: &str,
        seed: Bytes,
        credential: &Credential,
        orientation: Orientation,
        duration_frames: u32,
    ) -> Result<String, UpstreamError>;

    /// 角色绑定：上传参考素材，返回上游角色 ID
    async fn bind_character(
        &self,
        name: &str,
        seed: Bytes,
        credential: &Credential,
    ) -> Result<String, UpstreamError>;

    /// 基于已有产物的二次创作
    async fn remix(
        &self,
        prompt: &str,
        artifact_url: &str,
        credential: &Credential,
    ) -> Result<String, UpstreamError>;

    /// 下载素材字节（种子图片/视频）
    async fn fetch_media(&self, url: &str) -> Result<Bytes, UpstreamError>;
}
