//! Logging utilities for rendering raw modem traffic so logs stay single-line.
//! AT responses mix CR/LF with binary payload bytes; everything outside printable
//! ASCII is escaped.

/// Maximum number of input bytes rendered before the preview is cut.
const MAX_PREVIEW: usize = 300;

/// Escape a byte buffer for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - any other control or non-ASCII byte => `\\xNN`
///
/// Buffers longer than [`MAX_PREVIEW`] bytes are truncated with an ellipsis.
pub fn escape_bytes(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len().min(MAX_PREVIEW) + 8);
    for (count, &b) in data.iter().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7E => out.push(b as char),
            other => {
                let _ = write!(&mut out, "\\x{:02X}", other);
            }
        }
    }
    out
}

/// Lowercase hex of the first `max` bytes, for compact payload previews.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    data.iter()
        .take(max)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::{escape_bytes, hex_snippet};

    #[test]
    fn escapes_line_endings_and_binary() {
        let esc = escape_bytes(b"+CSQ:5\r\n\x00\xffOK");
        assert_eq!(esc, "+CSQ:5\\r\\n\\x00\\xFFOK");
    }

    #[test]
    fn truncates_long_buffers() {
        let data = vec![b'a'; 400];
        let esc = escape_bytes(&data);
        assert!(esc.ends_with('…'));
        assert_eq!(esc.chars().count(), 301);
    }

    #[test]
    fn hex_snippet_caps_length() {
        assert_eq!(hex_snippet(&[0x02, 0x00, 0xab, 0xcd], 3), "0200ab");
    }
}
