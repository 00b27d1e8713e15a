//! SSE 帧编解码
//!
//! 以"事件帧"为单位切分上游 SSE 流（空行分隔）。每一帧保留原始字节，
//! 未被改写的帧原样转发；需要改写时仅替换 data 行中的 JSON 载荷，
//! 其余行（event/id/注释）逐字保留，保证不破坏帧边界、不合并事件。

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::Decoder;

/// 一个完整的 SSE 事件帧
#[derive(Debug, Clone)]
pub struct SseFrame {
    /// 原始字节（含结尾空行；流末尾残帧可能没有结尾空行）
    raw: Bytes,
    /// event 字段值（如有）
    pub event: Option<String>,
    /// data 字段拼接结果（多行 data 以 \n 连接）
    pub data: Option<String>,
}

impl SseFrame {
    /// 解析 data 载荷为 JSON；`[DONE]`、空载荷与非 JSON 均返回 None
    pub fn data_json(&self) -> Option<Value> {
        let payload = self.data.as_deref()?.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }
        serde_json::from_str(payload).ok()
    }

    /// 原样输出
    pub fn into_raw(self) -> Bytes {
        self.raw
    }

    /// 用新的 JSON 载荷替换 data 行，其余行逐字保留。
    ///
    /// 多行 data 被折叠为一行（JSON 载荷本身不含换行）。
    pub fn with_data(&self, new_data: &Value) -> Bytes {
        let text = String::from_utf8_lossy(&self.raw);
        let terminated = text.ends_with("\n\n") || text.ends_with("\r\n\r\n");
        let mut out = String::with_capacity(self.raw.len());
        let mut data_written = false;
        for line in text.lines() {
            let trimmed = line.trim_end_matches('\r');
            if trimmed.starts_with("data:") || trimmed == "data" {
                if !data_written {
                    out.push_str("data: ");
                    out.push_str(&new_data.to_string());
                    out.push('\n');
                    data_written = true;
                }
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }
            out.push_str(trimmed);
            out.push('\n');
        }
        if !data_written {
            out.push_str("data: ");
            out.push_str(&new_data.to_string());
            out.push('\n');
        }
        if terminated {
            out.push('\n');
        }
        Bytes::from(out)
    }
}

/// 按空行切帧的 SSE 解码器
#[derive(Debug, Default)]
pub struct SseFrameCodec;

impl SseFrameCodec {
    pub fn new() -> Self {
        Self
    }

    fn parse_frame(raw: Bytes) -> SseFrame {
        let text = String::from_utf8_lossy(&raw);
        let mut event = None;
        let mut data_lines: Vec<&str> = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.find(':') {
                Some(idx) => {
                    let mut v = &line[idx + 1..];
                    if let Some(stripped) = v.strip_prefix(' ') {
                        v = stripped;
                    }
                    (&line[..idx], v)
                }
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data_lines.push(value),
                _ => {}
            }
        }
        let data = if data_lines.is_empty() {
            None
        } else {
            Some(data_lines.join("\n"))
        };
        SseFrame { raw, event, data }
    }

    /// 在缓冲区中寻找帧结束位置（空行之后的偏移）
    fn find_frame_end(src: &[u8]) -> Option<usize> {
        let mut i = 0;
        while i < src.len() {
            match src[i] {
                b'\n' => {
                    // \n\n
                    if src.get(i + 1) == Some(&b'\n') {
                        return Some(i + 2);
                    }
                    // \n\r\n
                    if src.get(i + 1) == Some(&b'\r') && src.get(i + 2) == Some(&b'\n') {
                        return Some(i + 3);
                    }
                }
                _ => {}
            }
            i += 1;
        }
        None
    }
}

impl Decoder for SseFrameCodec {
    type Item = SseFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<SseFrame>> {
        match Self::find_frame_end(src) {
            Some(end) => {
                let raw = src.split_to(end).freeze();
                Ok(Some(Self::parse_frame(raw)))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<SseFrame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // 流结束时的残帧（无结尾空行）也要完整转发
        let raw = src.split_to(src.len()).freeze();
        Ok(Some(Self::parse_frame(raw)))
    }
}
