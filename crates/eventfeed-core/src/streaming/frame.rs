//! Incremental parser for the search stream's text frames.
//!
//! ```text
//! event: item
//! data: {"id": "1", ...}
//!
//! ```
//!
//! A frame is an `event:` line followed by one or more `data:` lines and is
//! terminated by a blank line. Chunks may split lines (or UTF-8 sequences)
//! anywhere, so bytes are buffered until a newline arrives.

/// One named message unit from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
}

#[derive(Debug, Default)]
pub struct FrameParser {
    /// Bytes of the current, not yet terminated line
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut start = 0;

        for (i, byte) in chunk.iter().enumerate() {
            if *byte != b'\n' {
                continue;
            }
            self.pending.extend_from_slice(&chunk[start..i]);
            start = i + 1;

            let line_bytes = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&line_bytes);
            if let Some(frame) = self.accept_line(line.trim_end_matches('\r')) {
                frames.push(frame);
            }
        }
        self.pending.extend_from_slice(&chunk[start..]);

        frames
    }

    /// Flush whatever is buffered once the body has ended.
    ///
    /// Servers are not required to terminate the last frame with a blank line.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.pending.is_empty() {
            let line_bytes = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&line_bytes).into_owned();
            if let Some(frame) = self.accept_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn accept_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id, retry and unknown fields carry nothing we use
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);

        match event {
            Some(event) => Some(Frame {
                event,
                data: data.join("\n"),
            }),
            None if !data.is_empty() => Some(Frame {
                event: "message".to_string(),
                data: data.join("\n"),
            }),
            None => None,
        }
    }
}
