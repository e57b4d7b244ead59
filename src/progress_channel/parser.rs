use std::time::Duration;
use tracing::warn;

/// 单行的最大字节数。超出的行连同它所在的事件一起丢弃。
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// 一条完整的 SSE 事件。`event` 缺省为 `message`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// 增量解析 `text/event-stream`。字节可以在任意位置被切开，
/// 行尾支持 CR、LF 与 CRLF。
#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    oversized: bool,
    pending_cr: bool,
    first_line: bool,
    event: Option<String>,
    data: String,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            first_line: true,
            ..Self::default()
        }
    }

    /// 续传时沿用上一条连接的事件 id。
    pub fn with_last_event_id(last_event_id: Option<String>) -> Self {
        Self {
            last_event_id,
            ..Self::new()
        }
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// 服务端通过 `retry:` 建议的重连间隔。
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\r' => {
                    self.pending_cr = true;
                    self.end_line(&mut events);
                }
                b'\n' => self.end_line(&mut events),
                _ if self.oversized => {}
                _ if self.line.len() >= MAX_LINE_BYTES => {
                    warn!(limit = MAX_LINE_BYTES, "dropping oversized event stream line");
                    self.line = Vec::new();
                    self.oversized = true;
                }
                _ => self.line.push(byte),
            }
        }
        events
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        if std::mem::take(&mut self.oversized) {
            self.event = None;
            self.data.clear();
            return;
        }
        let raw = std::mem::take(&mut self.line);
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if self.first_line {
            self.first_line = false;
            if let Some(stripped) = line.strip_prefix('\u{feff}') {
                line = stripped.to_string();
            }
        }

        if line.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" if !value.contains('\0') => {
                self.last_event_id = (!value.is_empty()).then(|| value.to_string());
            }
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_event_id.clone(),
        })
    }
}
