//! Address expressions
//!
//! Expressions show up as configuration keys (`"0x401000"`, `"Rx1234"`, `"codecave:text+4"`) and
//! inside the `<...>`/`[...]` fields of a hack. They are sums of terms, each term being a numeric
//! literal, a register, a module-relative offset or the name of a code cave.

use std::collections::HashMap;
use std::hash::BuildHasher;

use thiserror::Error;

use crate::breakpoint::regs::RegisterSnapshot;

/// Prefix of an explicit code cave reference
pub const CODECAVE_PREFIX: &str = "codecave:";

/// Errors while resolving an expression
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// The token is neither a number, a register nor a known code cave
    #[error("unknown token `{0}`")]
    UnknownToken(String),
    /// The token looks like a number but doesn't parse as one
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
}

/// Source of named addresses, usually the allocated code caves
pub trait Symbols {
    /// Address registered under `name`
    fn symbol(&self, name: &str) -> Option<usize>;
}

impl<S: BuildHasher> Symbols for HashMap<String, usize, S> {
    fn symbol(&self, name: &str) -> Option<usize> {
        self.get(name).copied()
    }
}

/// No symbols at all
impl Symbols for () {
    fn symbol(&self, _name: &str) -> Option<usize> {
        None
    }
}

/// Evaluates expressions against the current engine state
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    /// Named addresses
    symbols: &'a dyn Symbols,
    /// Base of `Rx` offsets
    module_base: usize,
    /// Registers, if the expression is evaluated while a breakpoint fires
    registers: Option<&'a RegisterSnapshot>,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver looking names up in `symbols`
    pub fn new(symbols: &'a dyn Symbols) -> Self {
        Self {
            symbols,
            module_base: 0,
            registers: None,
        }
    }

    /// Sets the base address `Rx` offsets are relative to
    pub fn with_module_base(mut self, module_base: usize) -> Self {
        self.module_base = module_base;
        self
    }

    /// Allows register names, resolving to their value in `registers`
    pub fn with_registers(mut self, registers: &'a RegisterSnapshot) -> Self {
        self.registers = Some(registers);
        self
    }

    /// Evaluates `expr`. Arithmetic wraps at the machine word.
    pub fn resolve(&self, expr: &str) -> Result<usize, ExprError> {
        let mut total = 0usize;
        for (negative, term) in terms(expr) {
            let value = self.term(term.trim())?;
            total = if negative {
                total.wrapping_sub(value)
            } else {
                total.wrapping_add(value)
            };
        }
        Ok(total)
    }

    /// Evaluates a single term
    fn term(&self, term: &str) -> Result<usize, ExprError> {
        if term.is_empty() {
            return Err(ExprError::UnknownToken(term.to_owned()));
        }
        if let Some(value) = parse_literal(term) {
            return value;
        }
        if let Some(offset) = module_offset(term) {
            return Ok(self.module_base.wrapping_add(offset));
        }
        if let Some(name) = term.strip_prefix(CODECAVE_PREFIX) {
            return self
                .symbols
                .symbol(name.trim())
                .ok_or_else(|| ExprError::UnknownToken(term.to_owned()));
        }
        if let Some(value) = self.registers.and_then(|regs| regs.get(term)) {
            return Ok(value);
        }
        self.symbols
            .symbol(term)
            .ok_or_else(|| ExprError::UnknownToken(term.to_owned()))
    }
}

/// Splits an expression into signed terms
fn terms(expr: &str) -> impl Iterator<Item = (bool, &str)> {
    let mut rest = expr.trim();
    let mut negative = false;
    if let Some(stripped) = rest.strip_prefix('-') {
        negative = true;
        rest = stripped;
    }

    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        let term_negative = negative;
        match rest.find(['+', '-']) {
            Some(pos) => {
                negative = rest.as_bytes()[pos] == b'-';
                let term = &rest[..pos];
                rest = &rest[pos + 1..];
                Some((term_negative, term))
            }
            None => {
                done = true;
                Some((term_negative, rest))
            }
        }
    })
}

/// Parses a `0x` hexadecimal or a decimal literal.
///
/// Returns `None` if `term` isn't shaped like a number at all.
pub fn parse_literal(term: &str) -> Option<Result<usize, ExprError>> {
    let invalid = || ExprError::InvalidNumber(term.to_owned());
    if let Some(hex) = term
        .strip_prefix("0x")
        .or_else(|| term.strip_prefix("0X"))
    {
        return Some(usize::from_str_radix(hex, 16).map_err(|_| invalid()));
    }
    if term.starts_with(|c: char| c.is_ascii_digit()) {
        return Some(term.parse().map_err(|_| invalid()));
    }
    None
}

/// Offset of an `Rx<hex>` term
fn module_offset(term: &str) -> Option<usize> {
    let hex = term.strip_prefix("Rx").or_else(|| term.strip_prefix("rx"))?;
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn caves() -> HashMap<String, usize> {
        HashMap::from([("text".to_owned(), 0x5000), ("data".to_owned(), 0x6000)])
    }

    #[rstest]
    #[case::hex("0x401000", 0x401000)]
    #[case::upper_hex("0X1f", 0x1f)]
    #[case::decimal("1234", 1234)]
    #[case::module("Rx1000", 0x401000)]
    #[case::cave("codecave:text", 0x5000)]
    #[case::bare_cave("data", 0x6000)]
    #[case::sum("codecave:text + 0x10", 0x5010)]
    #[case::difference("data - text", 0x1000)]
    #[case::chain("Rx10+4-2", 0x400012)]
    fn test_resolve(#[case] expr: &str, #[case] expected: usize) {
        let caves = caves();
        let resolver = Resolver::new(&caves).with_module_base(0x400000);
        assert_eq!(resolver.resolve(expr), Ok(expected));
    }

    #[test]
    fn test_wrapping() {
        let resolver = Resolver::new(&());
        assert_eq!(resolver.resolve("-1"), Ok(usize::MAX));
        assert_eq!(resolver.resolve("0 - 2 + 1"), Ok(usize::MAX));
    }

    #[rstest]
    #[case::missing_cave("codecave:nope", ExprError::UnknownToken("codecave:nope".into()))]
    #[case::unknown("nope", ExprError::UnknownToken("nope".into()))]
    #[case::empty_term("1 + ", ExprError::UnknownToken("".into()))]
    #[case::bad_hex("0xzz", ExprError::InvalidNumber("0xzz".into()))]
    #[case::bad_decimal("12ab", ExprError::InvalidNumber("12ab".into()))]
    fn test_errors(#[case] expr: &str, #[case] expected: ExprError) {
        let caves = caves();
        let resolver = Resolver::new(&caves);
        assert_eq!(resolver.resolve(expr), Err(expected));
    }

    #[test]
    /// Registers are only known while a breakpoint fires
    fn test_registers() {
        let mut regs = RegisterSnapshot::default();
        *regs.register("retaddr").unwrap() = 0x1234;

        let caves = caves();
        let resolver = Resolver::new(&caves);
        assert!(resolver.resolve("retaddr").is_err());

        let resolver = resolver.with_registers(&regs);
        assert_eq!(resolver.resolve("RETADDR + 4"), Ok(0x1238));
        assert_eq!(resolver.resolve("text"), Ok(0x5000));
    }
}
