//! Immutable executable units
//!
//! The (external) compiler lowers a function body into a [`CodeUnit`]: an
//! opaque instruction stream, a literal pool, the declared-locals count and
//! the protected-range table the unwinder consults. The core never
//! interprets instruction semantics; it only provides the frame/stack
//! substrate units execute on.

use std::fmt;

use crate::value::Value;

/// One entry of a unit's protected-range table: instructions in
/// `[start, end)` are covered by the handler at `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedRange {
    /// First covered instruction offset
    pub start: u32,
    /// One past the last covered instruction offset
    pub end: u32,
    /// Handler entry point within the same unit
    pub handler: u32,
}

impl ProtectedRange {
    /// Whether `ip` falls inside this range
    #[inline]
    pub fn covers(&self, ip: u32) -> bool {
        self.start <= ip && ip < self.end
    }
}

/// An immutable compiled function body
pub struct CodeUnit {
    name: String,
    code: Box<[u32]>,
    literals: Box<[Value]>,
    locals: u16,
    protected: Box<[ProtectedRange]>,
    lines: Box<[u32]>,
}

impl CodeUnit {
    /// Assemble a unit. The instruction words are opaque to the core.
    pub fn new(
        name: impl Into<String>,
        code: Vec<u32>,
        literals: Vec<Value>,
        locals: u16,
        protected: Vec<ProtectedRange>,
    ) -> Self {
        Self {
            name: name.into(),
            code: code.into_boxed_slice(),
            literals: literals.into_boxed_slice(),
            locals,
            protected: protected.into_boxed_slice(),
            lines: Box::default(),
        }
    }

    /// Attach a source-line table, one entry per instruction word
    pub fn with_lines(mut self, lines: Vec<u32>) -> Self {
        self.lines = lines.into_boxed_slice();
        self
    }

    /// A unit with only a locals count; enough for frame machinery and tests
    pub fn stub(name: impl Into<String>, locals: u16) -> Self {
        Self::new(name, Vec::new(), Vec::new(), locals, Vec::new())
    }

    /// Unit name (diagnostics)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instruction stream
    pub fn code(&self) -> &[u32] {
        &self.code
    }

    /// The literal pool
    pub fn literal(&self, index: usize) -> Option<&Value> {
        self.literals.get(index)
    }

    /// Declared locals count
    pub fn locals(&self) -> u16 {
        self.locals
    }

    /// Protected ranges, in declaration order
    pub fn protected(&self) -> &[ProtectedRange] {
        &self.protected
    }

    /// The innermost protected range covering `ip`, if any. Ranges are
    /// ordered outermost-first by the compiler, so the last match wins.
    pub fn handler_for(&self, ip: u32) -> Option<&ProtectedRange> {
        self.protected.iter().rev().find(|r| r.covers(ip))
    }

    /// Source line of the instruction at `ip`, when line info was attached
    pub fn line_for(&self, ip: u32) -> Option<u32> {
        self.lines.get(ip as usize).copied()
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUnit")
            .field("name", &self.name)
            .field("code_len", &self.code.len())
            .field("locals", &self.locals)
            .field("protected", &self.protected.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_lookup() {
        let unit = CodeUnit::new(
            "f",
            vec![0; 20],
            Vec::new(),
            0,
            vec![
                ProtectedRange { start: 0, end: 20, handler: 18 },
                ProtectedRange { start: 5, end: 10, handler: 12 },
            ],
        );
        // Innermost (last declared) range wins.
        assert_eq!(unit.handler_for(7).unwrap().handler, 12);
        assert_eq!(unit.handler_for(3).unwrap().handler, 18);
        assert_eq!(unit.handler_for(10).unwrap().handler, 18);
        assert!(unit.handler_for(25).is_none());
    }

    #[test]
    fn test_line_table() {
        let unit = CodeUnit::new("f", vec![0; 3], Vec::new(), 0, Vec::new())
            .with_lines(vec![10, 10, 11]);
        assert_eq!(unit.line_for(2), Some(11));
        assert_eq!(unit.line_for(3), None);
        // Absent line info is not an error.
        assert_eq!(CodeUnit::stub("g", 0).line_for(0), None);
    }

    #[test]
    fn test_literal_pool() {
        let unit = CodeUnit::new("f", Vec::new(), vec![Value::int(7)], 2, Vec::new());
        assert_eq!(unit.literal(0).unwrap().as_int(), Some(7));
        assert!(unit.literal(1).is_none());
        assert_eq!(unit.locals(), 2);
    }
}
