//! ANSI escape sequence stripping.
//!
//! Pattern matching and interaction snippets work on plain text. The screen
//! buffer itself keeps raw bytes, so stripping happens on demand.

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

/// Strip ANSI escape sequences from raw terminal bytes, returning UTF-8 text.
///
/// Handles CSI (`ESC [`), OSC (terminated by BEL or `ESC \`) and two-byte
/// escapes. 8-bit C1 controls are left alone: `0x9B` is also a UTF-8
/// continuation byte. Carriage returns are dropped so `\r\n` becomes `\n`.
/// Invalid UTF-8 is replaced lossily.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            ESC => {
                i += 1;
                let Some(&kind) = input.get(i) else {
                    break;
                };
                i += 1;
                match kind {
                    b'[' => i = skip_csi(input, i),
                    b']' | b'P' | b'_' | b'^' => i = skip_string(input, i),
                    // Charset designation carries one more byte (ESC ( B).
                    b'(' | b')' | b'*' | b'+' => i += 1,
                    _ => {}
                }
            }
            b'\r' => i += 1,
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Length of a trailing UTF-8 sequence that is cut short, if any.
///
/// Chunked readers carry these bytes over so a character split across two
/// reads decodes whole.
pub fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let byte = bytes[i];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}

fn skip_csi(input: &[u8], mut i: usize) -> usize {
    // Parameter bytes 0x30-0x3F and intermediate bytes 0x20-0x2F.
    while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
        i += 1;
    }
    if i < input.len() && (0x40..=0x7E).contains(&input[i]) {
        i += 1;
    }
    i
}

fn skip_string(input: &[u8], mut i: usize) -> usize {
    while i < input.len() {
        if input[i] == BEL {
            return i + 1;
        }
        if input[i] == ESC && input.get(i + 1) == Some(&b'\\') {
            return i + 2;
        }
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(strip_ansi(b"hello world"), "hello world");
    }

    #[test]
    fn strips_sgr_and_cursor_moves() {
        assert_eq!(strip_ansi(b"\x1b[1;31merror\x1b[0m"), "error");
        assert_eq!(strip_ansi(b"\x1b[2A\x1b[2Khello"), "hello");
    }

    #[test]
    fn strips_private_mode_sequences() {
        assert_eq!(strip_ansi(b"\x1b[?25l\x1b[?2004hready"), "ready");
    }

    #[test]
    fn strips_osc_with_either_terminator() {
        assert_eq!(strip_ansi(b"\x1b]0;title\x07rest"), "rest");
        assert_eq!(strip_ansi(b"\x1b]0;title\x1b\\rest"), "rest");
    }

    #[test]
    fn drops_carriage_returns() {
        assert_eq!(strip_ansi(b"line\r\nnext\r\n"), "line\nnext\n");
    }

    #[test]
    fn truncated_escape() {
        assert_eq!(strip_ansi(b"text\x1b"), "text");
        assert_eq!(strip_ansi(b""), "");
    }

    #[test]
    fn keeps_multibyte_text_with_9b_continuation_bytes() {
        // 'ě' is C4 9B.
        let input = "\x1b[1mZkontrolujte změny\x1b[0m? for shortcuts".as_bytes();
        assert_eq!(strip_ansi(input), "Zkontrolujte změny? for shortcuts");
        assert_eq!(strip_ansi("出力 ✔ 완료".as_bytes()), "出力 ✔ 완료");
    }

    #[test]
    fn incomplete_tail_is_measured() {
        let check = "✔".as_bytes();
        assert_eq!(incomplete_utf8_tail(b"plain"), 0);
        assert_eq!(incomplete_utf8_tail(check), 0);
        assert_eq!(incomplete_utf8_tail(&check[..1]), 1);
        assert_eq!(incomplete_utf8_tail(&[b'a', check[0], check[1]]), 2);
        assert_eq!(incomplete_utf8_tail(b""), 0);
    }

    #[test]
    fn keeps_box_drawing_and_prompt_glyphs() {
        let input = "\x1b[2m╭──╮\x1b[22m\n│ > │\n? for shortcuts".as_bytes();
        assert_eq!(strip_ansi(input), "╭──╮\n│ > │\n? for shortcuts");
    }
}
