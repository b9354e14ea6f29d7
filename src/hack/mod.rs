//! # Binary hacks
//!
//! A hack is a short string describing the bytes to write at one address:
//!
//! | Item | Emits |
//! |---|---|
//! | `HH` | one literal byte |
//! | `<expr>`, `<expr:N>` | the value of `expr` in `N` bytes (1, 2, 4 or 8, machine word by default) |
//! | `[expr]`, `[expr:N]` | `expr` relative to the end of the field, in `N` bytes (1, 2 or 4, default 4) |
//!
//! ```
//! use std::collections::HashMap;
//! use hackpoints::hack::{expr::Resolver, Hack};
//!
//! let caves = HashMap::from([("foo".to_owned(), 0x2000usize)]);
//! let hack: Hack = "E8 [codecave:foo] 90".parse().unwrap();
//! assert_eq!(hack.size(), 6);
//!
//! let code = hack.render_to_vec(0x1000, &Resolver::new(&caves)).unwrap();
//! assert_eq!(code, [0xe8, 0xfb, 0x0f, 0x00, 0x00, 0x90]);
//! ```
//!
//! Parsing a hack is its size phase: the length of every field is known without resolving anything,
//! so caves can be sized before any of them exists. Rendering resolves the expressions against
//! the final address of the bytes.

use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::code;

use self::expr::{ExprError, Resolver};

pub mod expr;

/// Default width of a relative field
const DEFAULT_RELATIVE_WIDTH: usize = 4;

/// Errors while parsing or rendering a hack
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HackError {
    /// The hack string can't be parsed
    #[error("malformed hack at position {position}: {reason}")]
    MalformedHack {
        /// Byte offset into the hack string
        position: usize,
        /// What's wrong
        reason: String,
    },
    /// An expression couldn't be evaluated
    #[error("can't resolve `{token}`: {source}")]
    UnresolvedReference {
        /// The expression
        token: String,
        /// Why it failed
        #[source]
        source: ExprError,
    },
    /// The output buffer is smaller than the hack
    #[error("hack needs {needed} bytes but only {available} are available")]
    BufferTooSmall {
        /// Size of the hack
        needed: usize,
        /// Size of the buffer
        available: usize,
    },
    /// A value doesn't fit its field
    #[error("value of `{token}` doesn't fit in {width} bytes")]
    OutOfRange {
        /// The expression
        token: String,
        /// Width of the field
        width: usize,
    },
}

/// One item of a hack
#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    /// Literal bytes
    Bytes(Vec<u8>),
    /// Value of an expression
    Absolute {
        /// Expression text
        expr: String,
        /// Field width in bytes
        width: usize,
    },
    /// Displacement from the end of the field to an expression
    Relative {
        /// Expression text
        expr: String,
        /// Field width in bytes
        width: usize,
    },
}

impl Item {
    /// Number of bytes this item renders to
    fn size(&self) -> usize {
        match self {
            Item::Bytes(bytes) => bytes.len(),
            Item::Absolute { width, .. } | Item::Relative { width, .. } => *width,
        }
    }
}

/// A parsed hack, ready to be rendered at any address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hack {
    /// Items in order
    items: Vec<Item>,
    /// Combined size of all items
    size: usize,
}

/// Parsed hack descriptor
pub type HackDescriptor = Hack;

impl FromStr for Hack {
    type Err = HackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let items = parse(s)?;
        let size = items.iter().map(Item::size).sum();
        Ok(Self { items, size })
    }
}

impl Hack {
    /// Exact number of bytes [`Hack::render`] writes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the hack renders to nothing
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Renders the hack into `buf`, as if `buf` was located at `target`.
    ///
    /// Nothing is written unless every field resolves, so a failed render leaves `buf` untouched.
    /// Returns the number of bytes written.
    pub fn render(
        &self,
        buf: &mut [u8],
        target: usize,
        resolver: &Resolver<'_>,
    ) -> Result<usize, HackError> {
        if buf.len() < self.size {
            return Err(HackError::BufferTooSmall {
                needed: self.size,
                available: buf.len(),
            });
        }
        let code = self.render_to_vec(target, resolver)?;
        buf[..code.len()].copy_from_slice(&code);
        Ok(code.len())
    }

    /// Renders the hack into a new buffer, as if it was located at `target`
    pub fn render_to_vec(&self, target: usize, resolver: &Resolver<'_>) -> Result<Vec<u8>, HackError> {
        let mut code = Vec::with_capacity(self.size);
        for item in &self.items {
            match item {
                Item::Bytes(bytes) => code.extend_from_slice(bytes),
                Item::Absolute { expr, width } => {
                    let value = resolve(resolver, expr)? as isize as i64;
                    if !code::fits(value, *width) {
                        return Err(out_of_range(expr, *width));
                    }
                    code.extend_from_slice(&value.to_le_bytes()[..*width]);
                }
                Item::Relative { expr, width } => {
                    let value = resolve(resolver, expr)?;
                    let end = target.wrapping_add(code.len() + width);
                    let disp = code::displacement(end, value);
                    if !code::fits_signed(disp, *width) {
                        return Err(out_of_range(expr, *width));
                    }
                    code.extend_from_slice(&disp.to_le_bytes()[..*width]);
                }
            }
        }
        Ok(code)
    }
}

/// Resolves a field expression
fn resolve(resolver: &Resolver<'_>, expr: &str) -> Result<usize, HackError> {
    resolver
        .resolve(expr)
        .map_err(|source| HackError::UnresolvedReference {
            token: expr.to_owned(),
            source,
        })
}

/// Builds [`HackError::OutOfRange`]
fn out_of_range(expr: &str, width: usize) -> HackError {
    HackError::OutOfRange {
        token: expr.to_owned(),
        width,
    }
}

/// Builds [`HackError::MalformedHack`]
fn malformed(position: usize, reason: impl Into<String>) -> HackError {
    HackError::MalformedHack {
        position,
        reason: reason.into(),
    }
}

/// Splits a hack string into items
fn parse(s: &str) -> Result<Vec<Item>, HackError> {
    let mut items = Vec::new();
    let mut chars = s.char_indices().peekable();

    while let Some((position, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            c if c.is_ascii_hexdigit() => {
                let mut digits = String::from(c);
                while let Some(&(_, c)) = chars.peek() {
                    if !c.is_ascii_hexdigit() {
                        break;
                    }
                    digits.push(c);
                    chars.next();
                }
                if digits.len() % 2 != 0 {
                    return Err(malformed(position, "odd number of hex digits"));
                }
                let bytes = (0..digits.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| malformed(position, e.to_string()))?;
                match items.last_mut() {
                    Some(Item::Bytes(prev)) => prev.extend(bytes),
                    _ => items.push(Item::Bytes(bytes)),
                }
            }
            '<' | '[' => {
                let close = if c == '<' { '>' } else { ']' };
                let start = position + 1;
                let end = loop {
                    match chars.next() {
                        Some((i, c)) if c == close => break i,
                        Some(_) => {}
                        None => return Err(malformed(position, format!("missing `{close}`"))),
                    }
                };
                let field = &s[start..end];
                items.push(if c == '<' {
                    let (expr, width) = split_width(field, position, &[1, 2, 4, 8])?;
                    Item::Absolute {
                        expr,
                        width: width.unwrap_or(std::mem::size_of::<usize>()),
                    }
                } else {
                    let (expr, width) = split_width(field, position, &[1, 2, 4])?;
                    Item::Relative {
                        expr,
                        width: width.unwrap_or(DEFAULT_RELATIVE_WIDTH),
                    }
                });
            }
            c => return Err(malformed(position, format!("unexpected character `{c}`"))),
        }
    }
    Ok(items)
}

/// Splits the optional `:N` width suffix off a field
fn split_width(
    field: &str,
    position: usize,
    allowed: &[usize],
) -> Result<(String, Option<usize>), HackError> {
    let (expr, width) = match field.rsplit_once(':') {
        Some((expr, suffix)) => match suffix.trim().parse::<usize>() {
            Ok(width) if allowed.contains(&width) => (expr, Some(width)),
            Ok(width) => return Err(malformed(position, format!("invalid field width {width}"))),
            // `codecave:name`
            Err(_) => (field, None),
        },
        None => (field, None),
    };
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(malformed(position, "empty expression"));
    }
    Ok((expr.to_owned(), width))
}

/// A `binhacks` entry: either a bare hack string or an object
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "BinaryHackEntry")]
pub struct BinaryHack {
    /// Hack to write
    pub code: String,
    /// Name used in logs
    pub title: Option<String>,
    /// Hack that must match the bytes currently at the address
    pub expected: Option<String>,
    /// Skip the entry
    pub ignore: bool,
}

/// Raw shapes of a [`BinaryHack`]
#[derive(Deserialize)]
#[serde(untagged)]
enum BinaryHackEntry {
    /// `"addr": "90 90"`
    Code(String),
    /// `"addr": { "code": "90 90", ... }`
    Full {
        /// Hack to write
        code: String,
        /// Name used in logs
        #[serde(default)]
        title: Option<String>,
        /// Version guard
        #[serde(default)]
        expected: Option<String>,
        /// Skip the entry
        #[serde(default)]
        ignore: bool,
    },
}

impl From<BinaryHackEntry> for BinaryHack {
    fn from(entry: BinaryHackEntry) -> Self {
        match entry {
            BinaryHackEntry::Code(code) => Self {
                code,
                title: None,
                expected: None,
                ignore: false,
            },
            BinaryHackEntry::Full {
                code,
                title,
                expected,
                ignore,
            } => Self {
                code,
                title,
                expected,
                ignore,
            },
        }
    }
}

/// A `codecaves` entry: either a bare hack string or `{ "code", "size" }`
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "CodeCaveEntry")]
pub struct CodeCave {
    /// Hack rendered into the cave
    pub code: String,
    /// Minimum size of the cave
    pub size: Option<usize>,
}

/// Raw shapes of a [`CodeCave`]
#[derive(Deserialize)]
#[serde(untagged)]
enum CodeCaveEntry {
    /// `"name": "90 c3"`
    Code(String),
    /// `"name": { "code": "90 c3", "size": 32 }`
    Full {
        /// Hack rendered into the cave
        #[serde(default)]
        code: String,
        /// Minimum size of the cave
        #[serde(default)]
        size: Option<usize>,
    },
}

impl From<CodeCaveEntry> for CodeCave {
    fn from(entry: CodeCaveEntry) -> Self {
        match entry {
            CodeCaveEntry::Code(code) => Self { code, size: None },
            CodeCaveEntry::Full { code, size } => Self { code, size },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn render(code: &str, target: usize) -> Result<Vec<u8>, HackError> {
        let caves = HashMap::from([("foo".to_owned(), 0x2000usize)]);
        let hack: Hack = code.parse()?;
        let out = hack.render_to_vec(target, &Resolver::new(&caves).with_module_base(0x400000))?;
        assert_eq!(out.len(), hack.size());
        Ok(out)
    }

    #[rstest]
    #[case::nops("90 90", "9090")]
    #[case::packed("9090 c3", "9090c3")]
    #[case::byte("<0x7f:1>", "7f")]
    #[case::word("<0x1234:2>", "3412")]
    #[case::dword("<Rx10:4>", "10004000")]
    #[case::qword("<1:8>", "0100000000000000")]
    #[case::negative("<-1:2>", "ffff")]
    #[case::call("E8 [codecave:foo]", "e8fb0f0000")]
    #[case::short_jmp("eb [0x1010:1]", "eb0e")]
    #[case::cave_width("[codecave:foo:4]", "fc0f0000")]
    #[case::backward("e9 [0x800]", "e9fbf7ffff")]
    fn test_render(#[case] code: &str, #[case] expected: &str) {
        assert_eq!(hex::encode(render(code, 0x1000).unwrap()), expected);
    }

    #[test]
    fn test_default_absolute_width() {
        let hack: Hack = "<0x10>".parse().unwrap();
        assert_eq!(hack.size(), std::mem::size_of::<usize>());
    }

    #[test]
    /// The relative field is measured from its own end, wherever it sits in the hack
    fn test_relative_offset() {
        let site = 0x1000;
        let out = render("90 90 E8 [codecave:foo]", site).unwrap();
        let disp = i32::from_le_bytes(out[3..7].try_into().unwrap());
        assert_eq!(disp as i64, 0x2000 - (site as i64 + 3 + 4));
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(render("E8 [foo] <foo:4>", 0x1234), render("E8 [foo] <foo:4>", 0x1234));
    }

    #[rstest]
    #[case::odd("909", 0)]
    #[case::unterminated("90 <foo", 3)]
    #[case::empty("[ ]", 0)]
    #[case::unknown_char("90 zz", 3)]
    #[case::bad_width("<foo:3>", 0)]
    #[case::wide_relative("[foo:8]", 0)]
    fn test_malformed(#[case] code: &str, #[case] at: usize) {
        match code.parse::<Hack>() {
            Err(HackError::MalformedHack { position, .. }) => assert_eq!(position, at),
            other => panic!("expected MalformedHack, got {other:?}"),
        }
    }

    #[test]
    fn test_unresolved() {
        let err = render("E8 [codecave:bar]", 0x1000).unwrap_err();
        assert!(matches!(err, HackError::UnresolvedReference { token, .. } if token == "codecave:bar"));
    }

    #[rstest]
    #[case::absolute("<0x100:1>")]
    #[case::relative("eb [0x2000:1]")]
    fn test_out_of_range(#[case] code: &str) {
        assert!(matches!(render(code, 0x1000), Err(HackError::OutOfRange { .. })));
    }

    #[test]
    /// Nothing is written on error, and the size is checked before anything else
    fn test_render_into_buffer() {
        let caves = HashMap::from([("foo".to_owned(), 0x2000usize)]);
        let resolver = Resolver::new(&caves);

        let hack: Hack = "90 E8 [foo]".parse().unwrap();
        let mut small = [0u8; 4];
        assert_eq!(
            hack.render(&mut small, 0x1000, &resolver),
            Err(HackError::BufferTooSmall {
                needed: 6,
                available: 4
            })
        );

        let mut buf = [0xccu8; 8];
        let broken: Hack = "90 E8 [bar]".parse().unwrap();
        assert!(broken.render(&mut buf, 0x1000, &resolver).is_err());
        assert_eq!(buf, [0xcc; 8]);

        assert_eq!(hack.render(&mut buf, 0x1000, &resolver), Ok(6));
        assert_eq!(hex::encode(buf), "90e8fa0f0000cccc");
    }

    #[test]
    fn test_entries() {
        let hack: BinaryHack = serde_json::from_value(json!("90 90")).unwrap();
        assert_eq!(hack.code, "90 90");
        assert!(!hack.ignore);

        let hack: BinaryHack = serde_json::from_value(json!({
            "code": "c3",
            "title": "skip intro",
            "expected": "55",
            "ignore": true
        }))
        .unwrap();
        assert_eq!(hack.title.as_deref(), Some("skip intro"));
        assert_eq!(hack.expected.as_deref(), Some("55"));
        assert!(hack.ignore);

        let cave: CodeCave = serde_json::from_value(json!({ "code": "c3", "size": 32 })).unwrap();
        assert_eq!(cave.size, Some(32));
        let cave: CodeCave = serde_json::from_value(json!("c3")).unwrap();
        assert_eq!(cave.size, None);
    }
}
