//! 模型目录
//!
//! 模型名到生成形态（图像/视频）与画幅参数的静态映射。

use serde::Serialize;

/// 视频方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
}

/// 生成形态与画幅参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    /// 图像生成
    Image { width: u32, height: u32 },
    /// 视频生成
    Video {
        orientation: Orientation,
        duration_frames: u32,
    },
}

impl Modality {
    /// 形态标签（持久化用）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
        }
    }
}

/// 目录条目
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub name: &'static str,
    pub modality: Modality,
}

/// 静态模型目录
pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "pix-image",
        modality: Modality::Image {
            width: 1024,
            height: 1024,
        },
    },
    ModelSpec {
        name: "pix-image-hd",
        modality: Modality::Image {
            width: 2048,
            height: 2048,
        },
    },
    ModelSpec {
        name: "pix-video",
        modality: Modality::Video {
            orientation: Orientation::Landscape,
            duration_frames: 120,
        },
    },
    ModelSpec {
        name: "pix-video-portrait",
        modality: Modality::Video {
            orientation: Orientation::Portrait,
            duration_frames: 120,
        },
    },
];

/// 按模型名查找，未知模型返回 None
pub fn resolve(model: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|m| m.name == model)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试已知模型解析
    #[test]
    fn test_resolve_known_models() {
        let spec = resolve("pix-image").unwrap();
        assert!(matches!(
            spec.modality,
            Modality::Image {
                width: 1024,
                height: 1024
            }
        ));
        assert_eq!(spec.modality.kind(), "image");

        let spec = resolve("pix-video-portrait").unwrap();
        assert!(matches!(
            spec.modality,
            Modality::Video {
                orientation: Orientation::Portrait,
                ..
            }
        ));
        assert_eq!(spec.modality.kind(), "video");
    }

    /// 测试未知模型返回 None
    #[test]
    fn test_resolve_unknown_model() {
        assert!(resolve("gpt-4o").is_none());
        assert!(resolve("").is_none());
    }
}
