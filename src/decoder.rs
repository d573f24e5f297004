//! Incremental decoding of `text/event-stream` bodies into frames.
//!
//! Bytes arrive in whatever pieces the network hands us. The decoder keeps two
//! pieces of state between chunks: the tail of an unfinished UTF-8 sequence and
//! the text of an unfinished record. Neither is ever decoded twice.

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of one `data:` line, not yet parsed.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

/// Streaming UTF-8 decoder. Holds back an incomplete trailing sequence until
/// the bytes that finish it arrive.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, chunk: &[u8], out: &mut String) {
        let joined;
        let mut input: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            self.pending.extend_from_slice(chunk);
            joined = std::mem::take(&mut self.pending);
            &joined
        };

        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&input[..valid]) {
                        out.push_str(text);
                    }
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &input[valid + len..];
                        }
                        None => {
                            self.pending.extend_from_slice(&input[valid..]);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Flushes a sequence the stream never finished.
    pub(crate) fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            self.pending.clear();
            out.push(char::REPLACEMENT_CHARACTER);
        }
    }
}

/// Splits an SSE byte stream into frames. One decoder per stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    utf8: Utf8Decoder,
    buffer: String,
    pending_cr: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut text = String::with_capacity(chunk.len());
        self.utf8.decode(chunk, &mut text);
        self.append_normalized(&text);

        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let record: String = self.buffer.drain(..idx + 2).collect();
            extract_frames(&record[..idx], &mut frames);
        }
        frames
    }

    /// Ends the stream, yielding a final record that had no trailing blank line.
    pub fn finish(mut self) -> Vec<Frame> {
        let mut text = String::new();
        self.utf8.finish(&mut text);
        self.append_normalized(&text);
        if self.pending_cr {
            self.buffer.push('\n');
        }

        let mut frames = Vec::new();
        for record in self.buffer.split("\n\n") {
            extract_frames(record, &mut frames);
        }
        frames
    }

    /// Bytes of text held back waiting for a record separator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    // CRLF and lone CR both end a line. A CR at the end of a chunk is held
    // until the next character shows whether an LF follows it.
    fn append_normalized(&mut self, text: &str) {
        for c in text.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                self.buffer.push('\n');
                if c == '\n' {
                    continue;
                }
            }
            if c == '\r' {
                self.pending_cr = true;
            } else {
                self.buffer.push(c);
            }
        }
    }
}

fn extract_frames(record: &str, frames: &mut Vec<Frame>) {
    for line in record.lines() {
        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let payload = data.strip_prefix(' ').unwrap_or(data);
        if payload.trim().is_empty() {
            continue;
        }
        if payload.trim() == DONE_SENTINEL {
            frames.push(Frame::Done);
        } else {
            frames.push(Frame::Data(payload.to_string()));
        }
    }
}
