use std::collections::VecDeque;

/// Rolling job log with a short live window and a longer final window.
///
/// Only the most recent `max(live, final)` lines are stored; both views are
/// suffixes of the same sequence.
#[derive(Debug, Clone)]
pub(crate) struct LogBuffer {
    lines: VecDeque<String>,
    live: usize,
    final_: usize,
}

impl LogBuffer {
    pub fn with_windows(live: usize, final_: usize) -> Self {
        let cap = live.max(final_);
        Self {
            lines: VecDeque::with_capacity(cap.min(4096)),
            live,
            final_,
        }
    }

    /// Append one line and return the current live view.
    pub fn append(&mut self, line: impl Into<String>) -> String {
        self.push(line.into());
        self.live_view()
    }

    /// Append without rendering a view.
    pub fn push(&mut self, line: String) {
        let cap = self.live.max(self.final_);
        if cap == 0 {
            return;
        }
        if self.lines.len() == cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn live_view(&self) -> String {
        self.tail(self.live)
    }

    pub fn final_view(&self) -> String {
        self.tail(self.final_)
    }

    fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        let mut out = String::new();
        for (i, line) in self.lines.iter().skip(skip).enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}
