use memchr::memchr;

/// Splits an SSE body into lines as byte chunks arrive. Bytes are held only
/// until their newline shows up; nothing else is buffered.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete line, trimmed of surrounding whitespace and the
    /// CR of a CRLF ending. A line that is not valid UTF-8 is consumed and
    /// reported as an error so the caller can decide whether to skip or fail.
    pub fn next_line(&mut self) -> Option<Result<String, std::str::Utf8Error>> {
        let newline_pos = memchr(b'\n', &self.buf)?;
        let result = std::str::from_utf8(&self.buf[..newline_pos]).map(|s| s.trim().to_string());
        self.buf.drain(..=newline_pos);
        Some(result)
    }
}

/// Returns the payload of a `data:` line, tolerating both `data:x` and
/// `data: x` spacing. Non-data lines (comments, `event:`, blanks) yield
/// `None`.
pub fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}
