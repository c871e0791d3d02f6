//! 工具输出与媒体识别
//!
//! 工具可返回文本或二进制。二进制按声明的 MIME 前缀识别，缺省时按文件头魔数识别；
//! 无法识别的二进制只向模型报告长度。

use crate::memory::ContentPart;

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Binary { mime: Option<String>, data: Vec<u8> },
}

impl ToolOutput {
    pub fn text(s: impl Into<String>) -> Self {
        ToolOutput::Text(s.into())
    }

    pub fn binary(data: Vec<u8>) -> Self {
        ToolOutput::Binary { mime: None, data }
    }

    pub fn with_mime(mime: impl Into<String>, data: Vec<u8>) -> Self {
        ToolOutput::Binary {
            mime: Some(mime.into()),
            data,
        }
    }

    pub fn kind(&self) -> OutputKind {
        match self {
            ToolOutput::Text(_) => OutputKind::Text,
            ToolOutput::Binary { mime, data } => {
                let mime = mime.clone().or_else(|| sniff_mime(data).map(str::to_string));
                match mime {
                    Some(m) if m.starts_with("image/") => OutputKind::Image(m),
                    Some(m) if m.starts_with("audio/") => OutputKind::Audio(m),
                    _ => OutputKind::Unknown,
                }
            }
        }
    }

    /// 转为消息片段：文本 → 单个文本片段；图像 / 音频 → 说明 + 媒体片段；其它 → 占位文本
    pub fn into_parts(self, label: &str) -> Vec<ContentPart> {
        let kind = self.kind();
        match self {
            ToolOutput::Text(text) => vec![ContentPart::text(format!("{label}\n{text}"))],
            ToolOutput::Binary { data, .. } => match kind {
                OutputKind::Image(mime) => vec![
                    ContentPart::text(format!("{label}\n(image attached: {mime})")),
                    ContentPart::Image { mime, data },
                ],
                OutputKind::Audio(mime) => vec![
                    ContentPart::text(format!("{label}\n(audio attached: {mime})")),
                    ContentPart::Audio { mime, data },
                ],
                _ => vec![ContentPart::text(format!(
                    "{label}\n(unrecognized binary output, {} bytes)",
                    data.len()
                ))],
            },
        }
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        ToolOutput::Text(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        ToolOutput::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputKind {
    Text,
    Image(String),
    Audio(String),
    Unknown,
}

/// 按魔数识别常见图像 / 音频格式
pub fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    let riff_kind = |tag: &[u8]| data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == tag;
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(b"GIF8") {
        Some("image/gif")
    } else if riff_kind(b"WEBP") {
        Some("image/webp")
    } else if riff_kind(b"WAVE") {
        Some("audio/wav")
    } else if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) || data.starts_with(&[0xFF, 0xF3]) {
        Some("audio/mpeg")
    } else if data.starts_with(b"OggS") {
        Some("audio/ogg")
    } else if data.starts_with(b"fLaC") {
        Some("audio/flac")
    } else {
        None
    }
}
