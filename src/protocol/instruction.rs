//! Instruction type and wire codec.
//!
//! # Format
//!
//! An instruction is a comma separated list of elements terminated by `;`.
//! Each element is `<byte-length>.<bytes>`, the length counting UTF-8 bytes:
//!
//! ```text
//! 4.size,4.1024,3.768,2.96;
//! ```
//!
//! The first element is the opcode.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};

use super::{INTERNAL_OPCODE_PREFIX, MAX_GUAC_MESSAGE};

// ============================================================================
// Constants
// ============================================================================

/// Digits beyond this cannot describe an element that fits in a message.
const MAX_LENGTH_DIGITS: usize = 5;

// ============================================================================
// Instruction
// ============================================================================

/// One parsed protocol instruction: an opcode plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    opcode: String,
    args: Vec<String>,
}

impl Instruction {
    /// Creates a new instruction.
    #[must_use]
    pub fn new<I, S>(opcode: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcode: opcode.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the opcode.
    #[inline]
    #[must_use]
    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    /// Returns the arguments following the opcode.
    #[inline]
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Consumes the instruction, returning its arguments.
    #[inline]
    #[must_use]
    pub fn into_args(self) -> Vec<String> {
        self.args
    }

    /// Encodes the instruction into its wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Appends the wire form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let elements = std::iter::once(&self.opcode).chain(self.args.iter());

        for (index, element) in elements.enumerate() {
            if index > 0 {
                out.push(b',');
            }
            out.extend_from_slice(element.len().to_string().as_bytes());
            out.push(b'.');
            out.extend_from_slice(element.as_bytes());
        }
        out.push(b';');
    }

    /// Returns the number of bytes [`encode`](Self::encode) produces.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        std::iter::once(&self.opcode)
            .chain(self.args.iter())
            .map(|e| decimal_digits(e.len()) + 1 + e.len() + 1)
            .sum()
    }

    /// Parses exactly one complete instruction.
    ///
    /// # Errors
    ///
    /// - [`Error::Framing`] if the bytes are not one well formed instruction
    ///   or an element is not valid UTF-8
    /// - [`Error::InstructionTooLarge`] if the instruction exceeds the maximum size
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut framer = InstructionFramer::new();
        match framer.scan(bytes)? {
            Some(len) if len == bytes.len() => {}
            Some(len) => {
                return Err(Error::framing(format!(
                    "{} trailing bytes after instruction",
                    bytes.len() - len
                )));
            }
            None => return Err(Error::framing("incomplete instruction")),
        }

        let mut elements = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            // The framer already validated every boundary below.
            let dot = pos + find_byte(&bytes[pos..], b'.').unwrap_or(0);
            let length = parse_length(&bytes[pos..dot])?;
            let value = &bytes[dot + 1..dot + 1 + length];
            let element = std::str::from_utf8(value)
                .map_err(|e| Error::framing(format!("element is not valid UTF-8: {e}")))?;
            elements.push(element.to_owned());
            pos = dot + 1 + length + 1;
        }

        let mut elements = elements.into_iter();
        let opcode = elements.next().unwrap_or_default();
        Ok(Self {
            opcode,
            args: elements.collect(),
        })
    }

    /// Returns `true` if this instruction carries the reserved internal opcode.
    #[inline]
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.opcode == super::INTERNAL_DATA_OPCODE
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.encode()))
    }
}

/// Returns `true` if raw instruction bytes start with the reserved internal opcode.
#[inline]
#[must_use]
pub fn is_internal(raw: &[u8]) -> bool {
    raw.starts_with(INTERNAL_OPCODE_PREFIX)
}

// ============================================================================
// InstructionFramer
// ============================================================================

/// Resumable scanner locating the end of the first complete instruction.
///
/// The framer remembers which elements it has already validated, so calling
/// [`scan`](Self::scan) again after more bytes arrived continues where the
/// previous call stopped. The slice passed in must always begin at the same
/// instruction start until a complete instruction is reported.
#[derive(Debug, Default, Clone)]
pub struct InstructionFramer {
    /// Offset of the next unvalidated element, relative to the instruction start.
    element_start: usize,
}

impl InstructionFramer {
    /// Creates a framer positioned at the start of an instruction.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { element_start: 0 }
    }

    /// Forgets any partial progress.
    #[inline]
    pub fn reset(&mut self) {
        self.element_start = 0;
    }

    /// Scans `buf` for the first complete instruction.
    ///
    /// Returns `Ok(Some(len))` with the instruction's byte length including
    /// the terminating `;`, or `Ok(None)` when `buf` ends before the
    /// instruction does. Nothing is consumed in the `None` case.
    ///
    /// # Errors
    ///
    /// - [`Error::Framing`] on a non-digit length or a bad separator
    /// - [`Error::InstructionTooLarge`] if the instruction cannot fit in
    ///   [`MAX_GUAC_MESSAGE`] bytes
    pub fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        let mut pos = self.element_start;

        loop {
            let rest = &buf[pos.min(buf.len())..];

            let Some(dot) = find_byte(rest, b'.') else {
                check_digits(rest)?;
                if rest.len() > MAX_LENGTH_DIGITS {
                    return Err(Error::instruction_too_large(buf.len(), MAX_GUAC_MESSAGE));
                }
                self.element_start = pos;
                return Ok(None);
            };

            let length = parse_length(&rest[..dot])?;
            let separator = pos + dot + 1 + length;

            if separator >= MAX_GUAC_MESSAGE {
                return Err(Error::instruction_too_large(separator + 1, MAX_GUAC_MESSAGE));
            }

            let Some(&byte) = buf.get(separator) else {
                self.element_start = pos;
                return Ok(None);
            };

            match byte {
                b',' => pos = separator + 1,
                b';' => {
                    self.element_start = 0;
                    return Ok(Some(separator + 1));
                }
                other => {
                    return Err(Error::framing(format!(
                        "expected ',' or ';' at offset {separator}, found 0x{other:02x}"
                    )));
                }
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

fn check_digits(digits: &[u8]) -> Result<()> {
    match digits.iter().find(|b| !b.is_ascii_digit()) {
        Some(&bad) => Err(Error::framing(format!(
            "invalid byte 0x{bad:02x} in element length"
        ))),
        None => Ok(()),
    }
}

fn parse_length(digits: &[u8]) -> Result<usize> {
    if digits.is_empty() {
        return Err(Error::framing("missing element length"));
    }
    check_digits(digits)?;
    if digits.len() > MAX_LENGTH_DIGITS {
        return Err(Error::instruction_too_large(usize::MAX, MAX_GUAC_MESSAGE));
    }

    Ok(digits
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0')))
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

// ============================================================================
// Tests
// ============================================================================
