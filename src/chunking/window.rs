//! Token-bounded sliding-window splitting.
//!
//! Oversized semantic units are split line-by-line: a window accumulates
//! lines until the next line would push it past the token maximum, then the
//! next window re-opens a few lines back so consecutive windows overlap by
//! roughly `overlap_tokens`.

use crate::core::tokens::TokenCounter;

/// One window over a line range. Lines are absolute and 1-based inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSlice {
    /// First line of the window
    pub start_line: usize,
    /// Last line of the window
    pub end_line: usize,
    /// Window text
    pub text: String,
}

/// Split `text` (starting at absolute line `first_line`) into token-bounded
/// windows. Always returns at least one slice for non-empty input.
pub fn split_into_windows(
    text: &str,
    first_line: usize,
    max_tokens: usize,
    overlap_tokens: usize,
    counter: &TokenCounter,
) -> Vec<WindowSlice> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let line_tokens: Vec<usize> = lines.iter().map(|line| counter.count(line)).collect();
    let mut windows = Vec::new();
    let mut start = 0usize;

    while start < lines.len() {
        let mut end = start;
        let mut tokens = 0usize;

        while end < lines.len() {
            let next = line_tokens[end];
            // A single line larger than the whole budget still gets emitted
            // alone; otherwise the loop would never advance.
            if tokens > 0 && tokens + next > max_tokens {
                break;
            }
            tokens += next;
            end += 1;
            if tokens >= max_tokens {
                break;
            }
        }

        windows.push(WindowSlice {
            start_line: first_line + start,
            end_line: first_line + end - 1,
            text: lines[start..end].join("\n"),
        });

        if end >= lines.len() {
            break;
        }

        // Step the next window back until roughly `overlap_tokens` of the
        // tail is repeated, while guaranteeing forward progress.
        let mut overlap_start = end;
        let mut overlap = 0usize;
        while overlap_start > start + 1 && overlap < overlap_tokens {
            overlap_start -= 1;
            overlap += line_tokens[overlap_start];
        }
        start = overlap_start.max(start + 1);
    }

    windows
}
