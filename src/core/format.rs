//! Human-readable renderings of characteristic values.

const HEX_PREVIEW_MAX_CHARS: usize = 50;

/// Space-separated upper-case hex ("F0 A1 3B"), cut at 50 characters with "..." appended.
pub fn hex_preview(bytes: &[u8]) -> String {
    let hex = bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");

    if hex.len() > HEX_PREVIEW_MAX_CHARS {
        format!("{}...", &hex[..HEX_PREVIEW_MAX_CHARS])
    } else {
        hex
    }
}

/// UTF-8 text, with invalid sequences replaced.
pub fn text_preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
