//! BOF output capture and decoding.
//!
//! BOFs produce output by calling back into the Beacon output functions
//! while the entry function runs. Those callbacks land here, in a
//! thread-local accumulator: the entry call is synchronous on the caller's
//! thread, so concurrent invocations on different threads never share a
//! buffer. The accumulator is reset when an invocation starts and drained
//! when it returns.

use std::cell::RefCell;
use std::fmt::Write as _;

thread_local! {
    static ACCUMULATOR: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Clears the current thread's accumulator. Called at invocation start.
pub fn reset() {
    ACCUMULATOR.with(|a| a.borrow_mut().clear());
}

/// Drains and returns everything accumulated on this thread.
pub fn take() -> Vec<u8> {
    ACCUMULATOR.with(|a| std::mem::take(&mut *a.borrow_mut()))
}

/// Appends raw output bytes.
pub fn append_bytes(data: &[u8]) {
    ACCUMULATOR.with(|a| a.borrow_mut().extend_from_slice(data));
}

/// Appends formatted text.
pub fn append_str(s: &str) {
    append_bytes(s.as_bytes());
}

/// Appends a classic 16-bytes-per-row hex dump of `data`. Used for output
/// callbacks whose payload is not text.
pub fn append_hex_dump(data: &[u8]) {
    let mut out = String::with_capacity(data.len() * 4);
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", row * 16);
        for i in 0..16 {
            if i == 8 {
                out.push(' ');
            }
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {b:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        for &b in chunk {
            out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
        out.push_str("|\n");
    }
    append_str(&out);
}

/// Windows-1252 mappings for 0x80..=0x9F, the only range where the code
/// page differs from Latin-1. Bytes the code page leaves undefined decode
/// to U+FFFD.
const CP1252_HIGH: [char; 32] = [
    '\u{20ac}', '\u{fffd}', '\u{201a}', '\u{0192}', '\u{201e}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02c6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{fffd}', '\u{017d}', '\u{fffd}',
    '\u{fffd}', '\u{2018}', '\u{2019}', '\u{201c}', '\u{201d}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02dc}', '\u{2122}', '\u{0161}', '\u{203a}', '\u{0153}', '\u{fffd}', '\u{017e}', '\u{0178}',
];

/// Decodes captured BOF output to text.
///
/// Output origin (the host locale) is not controlled by the caller, so
/// this is best effort: UTF-8 first, then a Windows-1252 fallback. Decode
/// problems never surface as errors.
pub fn decode(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => e
            .as_bytes()
            .iter()
            .map(|&b| match b {
                0x80..=0x9f => CP1252_HIGH[(b - 0x80) as usize],
                other => other as char,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_drains() {
        reset();
        append_str("hello ");
        append_bytes(b"world");
        assert_eq!(take(), b"hello world");
        // drained: a second take is empty
        assert!(take().is_empty());
    }

    #[test]
    fn reset_discards_previous_output() {
        append_str("stale");
        reset();
        append_str("fresh");
        assert_eq!(take(), b"fresh");
    }

    #[test]
    fn hex_dump_rows() {
        reset();
        append_hex_dump(&[0x41, 0x42, 0x00, 0xff]);
        let text = String::from_utf8(take()).unwrap();
        assert!(text.starts_with("00000000  41 42 00 ff"), "{text}");
        assert!(text.ends_with("|AB..|\n"), "{text}");
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn hex_dump_second_row_offset() {
        reset();
        append_hex_dump(&[0u8; 17]);
        let text = String::from_utf8(take()).unwrap();
        let second = text.lines().nth(1).unwrap();
        assert!(second.starts_with("00000010 "), "{second}");
    }

    #[test]
    fn decode_utf8() {
        assert_eq!(decode("héllo".as_bytes().to_vec()), "héllo");
    }

    #[test]
    fn decode_falls_back_to_cp1252() {
        // 0x93/0x94 are curly quotes in cp1252 and invalid UTF-8 lead bytes
        assert_eq!(decode(vec![0x93, b'o', b'k', 0x94]), "\u{201c}ok\u{201d}");
        // latin-1 range passes through by identity
        assert_eq!(decode(vec![b'a', 0xe9, b'b']), "aéb");
    }

    #[test]
    fn decode_never_fails() {
        // undefined cp1252 bytes decode to the replacement character
        assert_eq!(decode(vec![0x81]), "\u{fffd}");
        assert_eq!(decode(Vec::new()), "");
    }
}
