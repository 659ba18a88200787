use std::collections::VecDeque;

/// Marker that replaces the dropped head of a full buffer
pub const TRUNCATION_MARKER: &str = "... <truncated>";

/// Suffix appended to lines cut at the maximum length
pub const LINE_ELLIPSIS: &str = "...";

pub const DEFAULT_MAX_LINE_LENGTH: usize = 250;
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Bounded buffer of captured output lines.
///
/// A limit of 0 disables it. Once more than `max_lines` lines arrive, the
/// oldest are dropped and [`TRUNCATION_MARKER`] leads the kept lines. The
/// marker takes one of the `max_lines` slots, except with a limit of 1 where
/// the newest line is still kept after it.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    max_line_length: usize,
    truncated: bool,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES, DEFAULT_MAX_LINE_LENGTH)
    }
}

impl OutputBuffer {
    pub fn new(max_lines: usize, max_line_length: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines,
            max_line_length,
            truncated: false,
        }
    }

    /// Room for output lines, not counting the marker
    fn capacity(&self) -> usize {
        if self.truncated {
            self.max_lines.saturating_sub(1).max(1)
        } else {
            self.max_lines
        }
    }

    pub fn push(&mut self, line: String) {
        let line = self.cut_line(line);

        if self.max_lines > 0 && self.lines.len() >= self.capacity() {
            self.truncated = true;
            while self.lines.len() >= self.capacity() {
                self.lines.pop_front();
            }
        }

        self.lines.push_back(line);
    }

    fn cut_line(&self, line: String) -> String {
        if self.max_line_length == 0 || line.chars().count() <= self.max_line_length {
            return line;
        }
        let mut cut: String = line.chars().take(self.max_line_length).collect();
        cut.push_str(LINE_ELLIPSIS);
        cut
    }

    /// Number of lines returned by [`into_lines`](Self::into_lines)
    pub fn len(&self) -> usize {
        self.lines.len() + usize::from(self.truncated)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_lines(self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.len());
        if self.truncated {
            lines.push(TRUNCATION_MARKER.to_string());
        }
        lines.extend(self.lines);
        lines
    }
}
