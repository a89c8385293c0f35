//! Byte-stream to line framing for the child protocol.

use procmux_core::Newline;

/// Accumulates raw output chunks and yields complete lines split on the
/// configured newline. Partial data stays buffered until more bytes arrive
/// or the caller drains the remainder at EOF.
#[derive(Debug)]
pub struct LineBuffer {
    newline: Newline,
    buf: String,
}

impl LineBuffer {
    pub fn new(newline: Newline) -> Self {
        Self {
            newline,
            buf: String::new(),
        }
    }

    pub fn extend(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
    }

    /// Pop the next complete line, without its newline.
    pub fn next_line(&mut self) -> Option<String> {
        let sep = self.newline.as_str();
        let idx = self.buf.find(sep)?;
        let line = self.buf[..idx].to_string();
        self.buf.drain(..idx + sep.len());
        Some(line)
    }

    /// Drain whatever is left after EOF. A terminated protocol never leaves
    /// a remainder; a crashed child may.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
