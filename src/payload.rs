//! Payload wire encoding
//!
//! Forwarded and monitoring payloads are published as JSON string literals,
//! byte-compatible with the encoder used by the existing consumers:
//! `<`, `>`, `&`, U+2028 and U+2029 are `\u` escaped, control characters
//! other than `\n`, `\r` and `\t` use lowercase `\u00XX` escapes, and every
//! byte of an invalid UTF-8 sequence becomes `\ufffd`.

use std::fmt;
use std::io;

use bytes::Bytes;
use serde::Serializer as _;
use serde_json::ser::{CharEscape, CompactFormatter, Formatter, Serializer};

/// Escape written for each invalid UTF-8 byte
const REPLACEMENT_ESCAPE: &[u8] = b"\\ufffd";

/// Payload encoding errors
#[derive(Debug)]
pub enum PayloadError {
    /// Writing the string literal failed
    Encode(serde_json::Error),
    /// Input is not a JSON string literal
    Decode(serde_json::Error),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::Encode(e) => write!(f, "payload encode error: {}", e),
            PayloadError::Decode(e) => write!(f, "payload decode error: {}", e),
        }
    }
}

impl std::error::Error for PayloadError {}

/// Writes string contents without the surrounding quotes so that valid
/// UTF-8 runs can be interleaved with replacement escapes.
struct BareStringFormatter;

impl Formatter for BareStringFormatter {
    fn begin_string<W>(&mut self, _writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        Ok(())
    }

    fn end_string<W>(&mut self, _writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        Ok(())
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let bytes = fragment.as_bytes();
        let mut start = 0;

        for (i, ch) in fragment.char_indices() {
            let escape: &[u8] = match ch {
                '<' => b"\\u003c",
                '>' => b"\\u003e",
                '&' => b"\\u0026",
                '\u{2028}' => b"\\u2028",
                '\u{2029}' => b"\\u2029",
                _ => continue,
            };
            writer.write_all(&bytes[start..i])?;
            writer.write_all(escape)?;
            start = i + ch.len_utf8();
        }

        writer.write_all(&bytes[start..])
    }

    fn write_char_escape<W>(&mut self, writer: &mut W, char_escape: CharEscape) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        match char_escape {
            CharEscape::Backspace => writer.write_all(b"\\u0008"),
            CharEscape::FormFeed => writer.write_all(b"\\u000c"),
            other => CompactFormatter.write_char_escape(writer, other),
        }
    }
}

/// Encode a raw payload as a quoted string literal
pub fn encode(payload: &[u8]) -> Result<Bytes, PayloadError> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(b'"');

    for chunk in payload.utf8_chunks() {
        let mut serializer = Serializer::with_formatter(&mut out, BareStringFormatter);
        serializer
            .serialize_str(chunk.valid())
            .map_err(PayloadError::Encode)?;

        for _ in chunk.invalid() {
            out.extend_from_slice(REPLACEMENT_ESCAPE);
        }
    }

    out.push(b'"');
    Ok(Bytes::from(out))
}

/// Encode a text payload as a quoted string literal
pub fn encode_str(text: &str) -> Result<Bytes, PayloadError> {
    encode(text.as_bytes())
}

/// Decode a quoted string literal back into text
pub fn decode(wire: &[u8]) -> Result<String, PayloadError> {
    serde_json::from_slice(wire).map_err(PayloadError::Decode)
}
