use serde::{Deserialize, Serialize};
use tracing::debug;

/// Size caps for a single tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationCaps {
    pub max_bytes: usize,
    pub max_lines: usize,
    pub head_lines: usize,
    pub tail_lines: usize,
}

impl Default for TruncationCaps {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024,
            max_lines: 256,
            head_lines: 128,
            tail_lines: 128,
        }
    }
}

/// Result of applying the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub content: String,
    pub truncated: bool,
}

impl Truncated {
    fn unchanged(content: String) -> Self {
        Self {
            content,
            truncated: false,
        }
    }
}

/// Truncate text to fit `caps`.
///
/// Keeps the first and last lines verbatim and replaces the middle with a
/// single marker line. If the result still exceeds the byte cap, the tail is
/// cut by bytes and an inline marker is appended. Applying this to its own
/// output with the same caps is a no-op.
pub fn truncate(content: &str, caps: &TruncationCaps) -> Truncated {
    let total_lines = content.split('\n').count();
    if content.len() <= caps.max_bytes && total_lines <= caps.max_lines {
        return Truncated::unchanged(content.to_string());
    }

    // Splitting only pays off when more than one line would be elided.
    let split = if total_lines > caps.head_lines + caps.tail_lines + 1 {
        elide_middle(content, total_lines, caps)
    } else {
        content.to_string()
    };

    let result = if split.len() > caps.max_bytes {
        hard_truncate(&split, caps.max_bytes)
    } else {
        split
    };

    if result == content {
        return Truncated::unchanged(result);
    }

    debug!(
        original_bytes = content.len(),
        original_lines = total_lines,
        truncated_bytes = result.len(),
        "tool output truncated"
    );
    Truncated {
        content: result,
        truncated: true,
    }
}

/// Truncate binary output by byte count only, with no line handling. Invalid
/// UTF-8 is replaced before cutting so the stored text stays within the cap.
pub fn truncate_binary(content: &[u8], max_bytes: usize) -> Truncated {
    let decoded = String::from_utf8_lossy(content);
    let result = if decoded.len() > max_bytes {
        hard_truncate(&decoded, max_bytes)
    } else {
        decoded.into_owned()
    };
    let truncated = result.as_bytes() != content;
    if truncated {
        debug!(
            original_bytes = content.len(),
            truncated_bytes = result.len(),
            "binary tool output truncated"
        );
    }
    Truncated {
        content: result,
        truncated,
    }
}

/// Binary output is anything that isn't UTF-8 or carries NUL bytes.
pub fn is_binary(content: &[u8]) -> bool {
    content.contains(&0) || std::str::from_utf8(content).is_err()
}

fn elide_middle(content: &str, total_lines: usize, caps: &TruncationCaps) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let head = &lines[..caps.head_lines];
    let tail = &lines[total_lines - caps.tail_lines..];
    let middle = &lines[caps.head_lines..total_lines - caps.tail_lines];

    let omitted = middle.len();
    // Joined length of the middle plus the newlines that separated it.
    let omitted_bytes: usize = middle.iter().map(|l| l.len() + 1).sum();
    let marker = format!("[... omitted {omitted} of {total_lines} lines ({omitted_bytes} bytes) ...]");

    let mut out = String::with_capacity(content.len().min(caps.max_bytes * 2));
    for line in head {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&marker);
    for line in tail {
        out.push('\n');
        out.push_str(line);
    }
    out
}

/// Cut `content` so that it plus an inline marker fits in `max_bytes`.
fn hard_truncate(content: &str, max_bytes: usize) -> String {
    // Upper bound on the marker length: it never reports more than `content.len()`.
    let marker_budget = truncation_marker(content.len()).len();
    if marker_budget >= max_bytes {
        return content[..floor_char_boundary(content, max_bytes)].to_string();
    }
    let keep = floor_char_boundary(content, max_bytes - marker_budget);
    let mut out = content[..keep].to_string();
    out.push_str(&truncation_marker(content.len() - keep));
    out
}

fn truncation_marker(dropped_bytes: usize) -> String {
    format!(" [... truncated {dropped_bytes} bytes ...]")
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
