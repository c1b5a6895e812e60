//! Server-sent events line buffering.

/// Splits an SSE byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the `data:` payloads of every completed line.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            if let Some(data) = Self::data_of(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a trailing line that never got its newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        Self::data_of(&rest)
    }

    fn data_of(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);

        // Skip empty lines and SSE comments
        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        line.strip_prefix("data:").map(|data| data.trim().to_string())
    }
}
