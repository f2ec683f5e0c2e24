/// Appended to any inbound or outbound text that was cut to the byte limit.
pub const TRUNCATION_MARKER: &str = "...(truncated)";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clamped {
    pub text: String,
    pub truncated: bool,
}

/// Cuts `text` to at most `max_bytes` bytes and appends [`TRUNCATION_MARKER`] when anything
/// was removed. The cut lands on the nearest UTF-8 boundary at or below the limit.
pub fn clamp_bytes(text: &str, max_bytes: usize) -> Clamped {
    if text.len() <= max_bytes {
        return Clamped {
            text: text.to_string(),
            truncated: false,
        };
    }

    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }

    let mut out = String::with_capacity(end + TRUNCATION_MARKER.len());
    out.push_str(&text[..end]);
    out.push_str(TRUNCATION_MARKER);
    Clamped {
        text: out,
        truncated: true,
    }
}
