use hyper::body::Bytes;
use serde::Serialize;

/// One logical server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so frames and
/// multi-byte characters may be split across reads arbitrarily.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and get every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            self.process_line(&line, &mut events);
            start = end + 1;
        }
        self.buffer.drain(..start);

        events
    }

    /// Flush a non-terminated last line and any pending event at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            self.process_line(&line, &mut events);
        }
        self.flush(&mut events);
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            self.flush(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush(&mut self, events: &mut Vec<SseEvent>) {
        let event = self.event.take();
        if self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event,
            data: std::mem::take(&mut self.data_lines).join("\n"),
        });
    }
}

/// `data: <payload>\n\n`
pub fn data_frame(data: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", data))
}

/// `event: <name>\ndata: <json>\n\n`
pub fn event_frame<T: Serialize>(name: &str, payload: &T) -> Bytes {
    let data = serde_json::to_string(payload).unwrap_or_default();
    Bytes::from(format!("event: {}\ndata: {}\n\n", name, data))
}

/// `data: <json>\n\n`
pub fn json_frame<T: Serialize>(payload: &T) -> Bytes {
    data_frame(&serde_json::to_string(payload).unwrap_or_default())
}
