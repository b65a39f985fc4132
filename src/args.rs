//! BOF argument packing.
//!
//! BOF entry functions receive their arguments as a flat binary buffer in
//! the Beacon wire format. This module packs typed argument lists (or a
//! human-readable `type:value` string) into that format.
//!
//! # Binary Format
//! Little-endian byte order throughout:
//! ```text
//! [4 bytes: total data length]
//! short:        [2 bytes: value]
//! int:          [4 bytes: value]
//! str / bin:    [4 bytes: length incl. NUL] [N bytes: data] [1 byte: NUL]
//! wstr:         [4 bytes: length incl. NUL] [N bytes: UTF-16LE] [2 bytes: NUL]
//! ```
//!
//! # Format Strings
//! A format string assigns one encoding per argument, one character each:
//! `s` short, `i` int, `z` string, `b` binary-as-string, `Z` wide string.
//! Without a format string each argument's variant selects its encoding.

use crate::error::{BofError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// A single typed BOF argument.
#[derive(Debug, Clone, PartialEq)]
pub enum BofArg {
    Short(i16),
    Int(i32),
    Str(String),
    WStr(String),
    Bin(Vec<u8>),
}

impl BofArg {
    fn kind(&self) -> &'static str {
        match self {
            BofArg::Short(_) => "short",
            BofArg::Int(_) => "int",
            BofArg::Str(_) => "str",
            BofArg::WStr(_) => "wstr",
            BofArg::Bin(_) => "bin",
        }
    }

    /// Human-readable rendering used by raw mode.
    fn render(&self) -> String {
        match self {
            BofArg::Short(v) => v.to_string(),
            BofArg::Int(v) => v.to_string(),
            BofArg::Str(s) | BofArg::WStr(s) => s.clone(),
            BofArg::Bin(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// Builder for the Beacon argument wire format.
///
/// Mirrors the `addshort`/`addint`/`addstr`/`addwstr` packer BOF tooling
/// ships with: fields accumulate in `buffer` and `getbuffer` prepends the
/// 4-byte total length.
#[derive(Debug, Default)]
pub struct BeaconPack {
    buffer: Vec<u8>,
}

impl BeaconPack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the finished buffer: `{u32 length}{fields}`.
    pub fn getbuffer(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.buffer.len());
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, self.buffer.len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(&self.buffer);
        out
    }

    /// Appends a 16-bit value, no length field.
    pub fn addshort(&mut self, v: i16) {
        let mut b = [0u8; 2];
        LittleEndian::write_i16(&mut b, v);
        self.buffer.extend_from_slice(&b);
    }

    /// Appends a 32-bit value, no length field.
    pub fn addint(&mut self, v: i32) {
        let mut b = [0u8; 4];
        LittleEndian::write_i32(&mut b, v);
        self.buffer.extend_from_slice(&b);
    }

    /// Appends a length-prefixed byte string with a trailing NUL. The
    /// length field counts the terminator.
    pub fn addstr(&mut self, s: &[u8]) {
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, (s.len() + 1) as u32);
        self.buffer.extend_from_slice(&len);
        self.buffer.extend_from_slice(s);
        self.buffer.push(0);
    }

    /// Appends a length-prefixed UTF-16LE string with a trailing wide NUL.
    /// The length field counts both terminator bytes.
    pub fn addwstr(&mut self, s: &str) {
        let wide: Vec<u8> = s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, (wide.len() + 2) as u32);
        self.buffer.extend_from_slice(&len);
        self.buffer.extend_from_slice(&wide);
        self.buffer.extend_from_slice(&[0, 0]);
    }
}

/// Characters permitted in a format string.
const VALID_FORMATS: &[char] = &['Z', 'z', 'i', 's', 'b'];

/// Packs `args` into the buffer the BOF entry function receives.
///
/// With a format string, each character dictates its argument's encoding;
/// the string's length must match the argument count. Without one, each
/// argument's variant selects the encoding. `raw` bypasses packing
/// entirely and space-joins the arguments as text (no length prefix);
/// it cannot be combined with a format string.
///
/// With no arguments and no raw mode the result is the 4-byte zero-length
/// prefix: a valid empty argument set, not an absent buffer.
pub fn pack(args: &[BofArg], format: Option<&str>, raw: bool) -> Result<Vec<u8>> {
    // an empty format string means "no format", same as None
    let format = format.filter(|fmt| !fmt.is_empty());
    if let Some(fmt) = format {
        for c in fmt.chars() {
            if !VALID_FORMATS.contains(&c) {
                return Err(BofError::InvalidFormat(c));
            }
        }
        if raw {
            return Err(BofError::IncompatibleOptions);
        }
        if fmt.chars().count() != args.len() {
            return Err(BofError::FormatMismatch(format!(
                "format describes {} arguments, {} supplied",
                fmt.chars().count(),
                args.len()
            )));
        }
    }

    if raw {
        let joined: Vec<String> = args.iter().map(BofArg::render).collect();
        return Ok(joined.join(" ").into_bytes());
    }

    let mut pack = BeaconPack::new();
    match format {
        Some(fmt) => {
            for (i, (c, arg)) in fmt.chars().zip(args.iter()).enumerate() {
                pack_one(&mut pack, c, arg)
                    .map_err(|_| mismatch(i, c, arg))?;
            }
        }
        None => {
            // Default encodings when no format is given: strings and byte
            // buffers pack as narrow strings, integrals as their width.
            for arg in args {
                match arg {
                    BofArg::Short(v) => pack.addshort(*v),
                    BofArg::Int(v) => pack.addint(*v),
                    BofArg::Str(s) | BofArg::WStr(s) => pack.addstr(s.as_bytes()),
                    BofArg::Bin(b) => pack.addstr(b),
                }
            }
        }
    }

    Ok(pack.getbuffer())
}

fn mismatch(index: usize, c: char, arg: &BofArg) -> BofError {
    BofError::FormatMismatch(format!(
        "argument {} ({}) cannot be encoded as '{}'",
        index,
        arg.kind(),
        c
    ))
}

/// Encodes one argument under a format character. `Err(())` means the
/// variant does not fit the requested encoding.
fn pack_one(pack: &mut BeaconPack, c: char, arg: &BofArg) -> std::result::Result<(), ()> {
    match (c, arg) {
        ('s', BofArg::Short(v)) => pack.addshort(*v),
        ('s', BofArg::Int(v)) => pack.addshort(i16::try_from(*v).map_err(|_| ())?),
        ('i', BofArg::Int(v)) => pack.addint(*v),
        ('i', BofArg::Short(v)) => pack.addint(i32::from(*v)),
        ('z', BofArg::Str(s)) | ('z', BofArg::WStr(s)) => pack.addstr(s.as_bytes()),
        ('z', BofArg::Bin(b)) => pack.addstr(b),
        // 'b' packs like 'z': length counts a trailing NUL.
        ('b', BofArg::Bin(b)) => pack.addstr(b),
        ('b', BofArg::Str(s)) => pack.addstr(s.as_bytes()),
        ('Z', BofArg::Str(s)) | ('Z', BofArg::WStr(s)) => pack.addwstr(s),
        _ => return Err(()),
    }
    Ok(())
}

/// Parses a human-readable argument string into typed [`BofArg`] values.
///
/// Arguments are space-separated `type:value` pairs; quoted values may
/// contain spaces:
/// - `short:123` or `s:123` - 16-bit signed integer
/// - `int:456` or `i:456` - 32-bit signed integer
/// - `str:hello` or `z:hello` - narrow string
/// - `wstr:C:\path` or `Z:C:\path` - wide (UTF-16) string
/// - `bin:base64data` or `b:base64data` - binary data (base64 encoded)
///
/// Type keywords are case-insensitive except the `Z`/`z` shorthands,
/// which keep the wide/narrow distinction.
pub fn pack_arguments(args_str: &str) -> Result<Vec<BofArg>> {
    if args_str.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut args = Vec::new();
    for part in split_args(args_str) {
        if let Some((type_str, value)) = part.split_once(':') {
            let arg = match type_str {
                "Z" => BofArg::WStr(unquote(value)),
                _ => match type_str.to_lowercase().as_str() {
                    "short" | "s" => BofArg::Short(value.parse().map_err(|_| {
                        BofError::FormatMismatch(format!("invalid short value: {value}"))
                    })?),
                    "int" | "i" => BofArg::Int(value.parse().map_err(|_| {
                        BofError::FormatMismatch(format!("invalid int value: {value}"))
                    })?),
                    "str" | "z" => BofArg::Str(unquote(value)),
                    "wstr" => BofArg::WStr(unquote(value)),
                    "bin" | "b" => BofArg::Bin(base64::decode(value).map_err(|_| {
                        BofError::FormatMismatch(format!("invalid base64 in bin argument: {value}"))
                    })?),
                    _ => {
                        return Err(BofError::FormatMismatch(format!(
                            "unknown argument type: {type_str}"
                        )))
                    }
                },
            };
            args.push(arg);
        } else if !part.trim().is_empty() {
            return Err(BofError::FormatMismatch(format!(
                "invalid argument (expected type:value): {part}"
            )));
        }
    }

    Ok(args)
}

/// Splits an argument string on whitespace while respecting quoted values.
///
/// Handles both single and double quotes, allowing spaces within quoted
/// strings.
fn split_args(s: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut quote_char = '"';

    for (i, c) in s.char_indices() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = c;
            }
            c if c == quote_char && in_quotes => {
                in_quotes = false;
            }
            ' ' | '\t' if !in_quotes => {
                let part = s[start..i].trim();
                if !part.is_empty() {
                    result.push(part);
                }
                start = i + 1;
            }
            _ => {}
        }
    }

    let part = s[start..].trim();
    if !part.is_empty() {
        result.push(part);
    }

    result
}

/// Removes surrounding quotes from a string value.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
