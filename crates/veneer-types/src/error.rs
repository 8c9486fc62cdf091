//! Descriptor syntax errors with source carets.

use crate::token::Span;

/// A syntax error in a foreign-function descriptor.
///
/// Carries the descriptor source so `Display` can render a caret under the
/// offending span:
///
/// ```text
/// cannot parse descriptor: unknown type name `flot`
///   read func(&void[=@2],flot)size_t
///                        ^^^^
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    message: String,
    source: String,
    span: Span,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, source: &str, span: Span) -> Self {
        SyntaxError {
            message: message.into(),
            source: source.to_string(),
            span,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn span(&self) -> Span {
        self.span
    }
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "cannot parse descriptor: {}", self.message)?;
        writeln!(f, "  {}", self.source)?;

        // Column positions count characters, not bytes; descriptors are
        // expected to be ASCII but a stray multibyte char must not panic.
        let col = self.source[..self.span.start.min(self.source.len())]
            .chars()
            .count();
        let width = self.source
            [self.span.start.min(self.source.len())..self.span.end.min(self.source.len())]
            .chars()
            .count()
            .max(1);

        write!(f, "  {}{}", " ".repeat(col), "^".repeat(width))
    }
}

impl std::error::Error for SyntaxError {}
