//! Tokenizer for foreign-function descriptors.
//!
//! Descriptors are single-line strings such as
//! `read func(&void[=@2],size_t=@1,size_t)size_t; errno()`.
//! This module lexes them into `(Token, Span)` pairs using logos; the
//! parser in [`crate::descriptor`] consumes the stream and slices
//! identifier text back out of the source by span.

use logos::Logos;

use crate::error::SyntaxError;

/// Byte range of a token within the descriptor source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    /// Zero-width span at a byte position, used for end-of-input errors.
    pub fn at(pos: usize) -> Self {
        Span { start: pos, end: pos }
    }
}

/// Logos-based token enum for descriptor lexing.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t]+")]
pub enum Token {
    // Keywords
    #[token("func")]
    Func,

    // Names and numbers
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,
    #[regex(r"[0-9]+")]
    Int,

    // Structure
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,

    // Ownership and elision markers
    #[token("&")]
    Amp,
    #[token("#")]
    Hash,
    #[token("-")]
    Minus,
    #[token("!")]
    Bang,

    // Assertion runes
    #[token("=")]
    Eq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("/")]
    Slash,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token("^")]
    CaretRune,
    #[token("~")]
    Tilde,
    #[token("@")]
    At,

    // Capacity brackets
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    // Recognized so the parser can reject them with a located error
    #[token("...")]
    Ellipsis,
    #[token("*")]
    Star,
}

/// Tokenize a descriptor into `(Token, Span)` pairs.
///
/// The only lexical error is an unexpected character; everything else is
/// deferred to the parser so that error carets point at whole constructs.
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span::new(range.start, range.end);
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                return Err(SyntaxError::new(
                    format!("unexpected character {:?}", &source[range.start..range.end]),
                    source,
                    span,
                ));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|(token, _)| token)
            .collect()
    }

    #[test]
    fn test_tokenize_simple_descriptor() {
        assert_eq!(
            kinds("puts func(#char)int"),
            vec![
                Token::Ident,
                Token::Func,
                Token::LParen,
                Token::Hash,
                Token::Ident,
                Token::RParen,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn test_tokenize_assertion_runes() {
        assert_eq!(
            kinds("=@1 <@2 >@3 /@4 ?@5 :@6 ^@7 ~@8"),
            vec![
                Token::Eq,
                Token::At,
                Token::Int,
                Token::Lt,
                Token::At,
                Token::Int,
                Token::Gt,
                Token::At,
                Token::Int,
                Token::Slash,
                Token::At,
                Token::Int,
                Token::Question,
                Token::At,
                Token::Int,
                Token::Colon,
                Token::At,
                Token::Int,
                Token::CaretRune,
                Token::At,
                Token::Int,
                Token::Tilde,
                Token::At,
                Token::Int,
            ]
        );
    }

    #[test]
    fn test_tokenize_capacity_and_markers() {
        assert_eq!(
            kinds("&void[=@2],-size_t"),
            vec![
                Token::Amp,
                Token::Ident,
                Token::LBracket,
                Token::Eq,
                Token::At,
                Token::Int,
                Token::RBracket,
                Token::Comma,
                Token::Minus,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn test_tokenize_func_keyword_vs_ident() {
        // `func` is a keyword, `funcs` stays an identifier
        assert_eq!(kinds("func funcs"), vec![Token::Func, Token::Ident]);
    }

    #[test]
    fn test_tokenize_rejects_unknown_character() {
        let err = tokenize("func(%)").unwrap_err();
        assert!(err.to_string().contains("unexpected character"));
    }

    #[test]
    fn test_spans_index_source_text() {
        let source = "write func(int)";
        let tokens = tokenize(source).unwrap();
        let (token, span) = tokens[0];
        assert_eq!(token, Token::Ident);
        assert_eq!(&source[span.start..span.end], "write");
    }
}
