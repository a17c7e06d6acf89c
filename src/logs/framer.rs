/// Line prefix that opens a history event block.
pub const START_MARKER: &str = "Start-Date: ";

/// Line prefix that closes a history event block.
pub const END_MARKER: &str = "End-Date: ";

/// Accumulates lines between the start and end markers into one block.
///
/// Lines seen while no block is open are ignored. A start marker always
/// wins: it discards any unterminated block that was still buffering.
/// A block left open at end of input is retained, not emitted, so the
/// remainder can complete once more bytes arrive.
#[derive(Debug, Default)]
pub struct BlockFramer {
    buf: String,
    open: bool,
}

impl BlockFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one line (without its trailing newline). Returns the full
    /// block text, markers included, when this line closes a block.
    pub fn feed(&mut self, line: &str) -> Option<String> {
        if line.starts_with(START_MARKER) {
            self.buf.clear();
            self.open = true;
        }

        if !self.open {
            return None;
        }

        self.buf.push_str(line);
        self.buf.push('\n');

        if line.starts_with(END_MARKER) {
            self.open = false;
            return Some(std::mem::take(&mut self.buf));
        }

        None
    }

    /// Whether a block is currently buffering, waiting for its end marker.
    pub fn has_open_block(&self) -> bool {
        self.open
    }
}
