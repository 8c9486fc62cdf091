//! Recursive-descent parser for foreign-function descriptors.
//!
//! The grammar, one descriptor per managed function:
//!
//! ```text
//! descriptor := [ symbol ] func-type [ ';' on-failure ]
//! func-type  := 'func' '(' [ type {',' type} ] ')' [ type ]
//! type       := [ '!' ] [ '-' ] [ '&' | '#' ] name { suffix }
//! suffix     := rune '@' index | '[' ( '=' '@' index | integer ) ']'
//! rune       := '=' | '<' | '>' | '/' | '?' | ':' | '^' | '~'
//! on-failure := symbol '(' [ '@' index {',' '@' index} ] ')'
//! ```
//!
//! `func` recurses for callback arguments. Every `@index` is validated
//! against the argument count of the signature it appears in; an argument
//! is marked elided either by the explicit `-` marker or by the mutual
//! capacity/equality pair (`&void[=@2],size_t=@1` elides the `size_t`).

use crate::error::SyntaxError;
use crate::kind::{self, Kind};
use crate::sig::{AssertKind, Assertion, Capacity, Marker, OnFailure, Signature, Ty};
use crate::token::{self, Span, Token};

/// Parse a descriptor into a validated [`Signature`].
pub fn parse(source: &str) -> Result<Signature, SyntaxError> {
    let tokens = token::tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    parser.parse_descriptor()
}

/// A recorded `@index` reference, resolved once the owning signature's
/// argument count is known (indices may refer forward).
struct IndexRef {
    index: u8,
    span: Span,
    /// 0-based position of the argument carrying the reference, when the
    /// reference must not point back at itself.
    owner: Option<usize>,
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    // ====== Token helpers ======

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).map(|&(token, _)| token)
    }

    fn peek_second(&self) -> Option<Token> {
        self.tokens.get(self.pos + 1).map(|&(token, _)| token)
    }

    fn bump(&mut self) -> Option<(Token, Span)> {
        let entry = self.tokens.get(self.pos).copied();
        if entry.is_some() {
            self.pos += 1;
        }
        entry
    }

    fn eat(&mut self, token: Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            return true;
        }
        false
    }

    /// Span of the current token, or a zero-width span at end of input.
    fn here(&self) -> Span {
        match self.tokens.get(self.pos) {
            Some(&(_, span)) => span,
            None => Span::at(self.source.len()),
        }
    }

    fn text(&self, span: Span) -> &'a str {
        &self.source[span.start..span.end]
    }

    fn error(&self, message: impl Into<String>, span: Span) -> SyntaxError {
        SyntaxError::new(message, self.source, span)
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<Span, SyntaxError> {
        if self.peek() == Some(token) {
            let span = self.here();
            self.pos += 1;
            return Ok(span);
        }
        Err(self.error(format!("expected {what}"), self.here()))
    }

    // ====== Grammar ======

    fn parse_descriptor(&mut self) -> Result<Signature, SyntaxError> {
        // A leading identifier followed by `func` names the foreign symbol.
        let symbol = if self.peek() == Some(Token::Ident) && self.peek_second() == Some(Token::Func)
        {
            let (_, span) = self.bump().unwrap();
            Some(self.text(span).to_string())
        } else {
            None
        };

        let mut sig = self.parse_func_type()?;
        sig.symbol = symbol;

        if self.eat(Token::Semi) {
            let (clause, refs) = self.parse_on_failure()?;
            self.check_refs(&refs, sig.args.len())?;
            sig.on_failure = Some(clause);
        }

        if self.pos < self.tokens.len() {
            return Err(self.error("unexpected tokens after descriptor", self.here()));
        }

        Ok(sig)
    }

    fn parse_func_type(&mut self) -> Result<Signature, SyntaxError> {
        self.expect(Token::Func, "`func`")?;
        self.expect(Token::LParen, "`(`")?;

        let mut args = Vec::new();
        let mut arg_spans = Vec::new();
        let mut refs = Vec::new();

        if !self.eat(Token::RParen) {
            loop {
                let start = self.here();
                let ty = self.parse_type(Some(args.len()), &mut refs)?;
                args.push(ty);
                arg_spans.push(start);
                if self.eat(Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, "`,` or `)`")?;
                break;
            }
        }

        // A return type follows unless the descriptor ends here.
        let ret = match self.peek() {
            None | Some(Token::Semi) | Some(Token::Comma) | Some(Token::RParen) => None,
            _ => Some(self.parse_type(None, &mut refs)?),
        };

        self.check_refs(&refs, args.len())?;
        self.mark_elided(&mut args, &arg_spans)?;

        // `...` may only close the argument list.
        for (i, arg) in args.iter().enumerate() {
            if arg.kind == Kind::Variadic && i + 1 != args.len() {
                return Err(self.error("`...` must be the last argument", arg_spans[i]));
            }
        }

        Ok(Signature {
            symbol: None,
            args,
            ret,
            on_failure: None,
        })
    }

    /// Parse one type. `arg_index` is `Some` for arguments (0-based
    /// position) and `None` for return types.
    fn parse_type(
        &mut self,
        arg_index: Option<usize>,
        refs: &mut Vec<IndexRef>,
    ) -> Result<Ty, SyntaxError> {
        let start = self.here();
        let inverted = self.eat(Token::Bang);
        let elided = self.eat(Token::Minus);
        let marker = if self.eat(Token::Amp) {
            Marker::Mutable
        } else if self.eat(Token::Hash) {
            Marker::Immutable
        } else {
            Marker::None
        };

        if self.peek() == Some(Token::Star) {
            return Err(self.error(
                "`*` is not a pointer marker here; use `&` (mutable) or `#` (read-only)",
                self.here(),
            ));
        }

        if elided && arg_index.is_none() {
            return Err(self.error("return value cannot be elided", start));
        }

        let mut ty = match self.peek() {
            Some(Token::Ellipsis) => {
                self.bump();
                let mut ty = Ty::new(Kind::Variadic);
                ty.inverted = inverted;
                return Ok(ty);
            }
            Some(Token::Func) => {
                let nested = self.parse_func_type()?;
                let mut ty = Ty::new(Kind::Callback);
                ty.func = Some(Box::new(nested));
                ty
            }
            Some(Token::Ident) => {
                let span = self.here();
                self.bump();
                let name = self.text(span);
                match kind::lookup(name) {
                    Some(k) => Ty::new(k),
                    None => {
                        return Err(self.error(format!("unknown type name `{name}`"), span));
                    }
                }
            }
            _ => {
                return Err(self.error("expected a type name", self.here()));
            }
        };

        ty.marker = marker;
        ty.elided = elided;
        ty.inverted = inverted;

        // Suffixes: at most one assertion and one capacity per type.
        loop {
            let rune_span = self.here();
            let assert_kind = match self.peek() {
                Some(Token::Eq) => Some(AssertKind::Equality),
                Some(Token::Lt) => Some(AssertKind::LessThan),
                Some(Token::Gt) => Some(AssertKind::MoreThan),
                Some(Token::Slash) => Some(AssertKind::Indirect),
                Some(Token::Question) => Some(AssertKind::OfFormat),
                Some(Token::Colon) => Some(AssertKind::SameType),
                Some(Token::CaretRune) => Some(AssertKind::Lifetime),
                Some(Token::Tilde) => Some(AssertKind::Overlaps),
                _ => None,
            };

            if let Some(kind) = assert_kind {
                self.bump();
                self.expect(Token::At, "`@` after assertion rune")?;
                let (index, span) = self.parse_index()?;
                if ty.assertion.is_some() {
                    return Err(self.error("multiple assertions on one type", rune_span));
                }
                refs.push(IndexRef {
                    index,
                    span,
                    owner: arg_index,
                });
                ty.assertion = Some(Assertion { kind, index });
                continue;
            }

            if self.eat(Token::LBracket) {
                if ty.capacity.is_some() {
                    return Err(self.error("multiple capacity suffixes on one type", rune_span));
                }
                let capacity = if self.eat(Token::Eq) {
                    self.expect(Token::At, "`@` after `=` in capacity")?;
                    let (index, span) = self.parse_index()?;
                    refs.push(IndexRef {
                        index,
                        span,
                        owner: arg_index,
                    });
                    Capacity::Equals(index)
                } else {
                    let span = self.expect(Token::Int, "capacity count or `=@N`")?;
                    let count: u32 = self.text(span).parse().map_err(|_| {
                        self.error("capacity count out of range", span)
                    })?;
                    Capacity::Fixed(count)
                };
                self.expect(Token::RBracket, "`]`")?;
                ty.capacity = Some(capacity);

                // `struct[N]` fills in the aggregate byte size.
                if let (Kind::Aggregate { .. }, Capacity::Fixed(size)) = (ty.kind, capacity) {
                    let align = if size >= 8 {
                        8
                    } else {
                        size.next_power_of_two().max(1)
                    };
                    ty.kind = Kind::Aggregate { size, align };
                }
                continue;
            }

            break;
        }

        Ok(ty)
    }

    fn parse_index(&mut self) -> Result<(u8, Span), SyntaxError> {
        let span = self.expect(Token::Int, "argument index")?;
        let index: u8 = self
            .text(span)
            .parse()
            .map_err(|_| self.error("argument index out of range", span))?;
        if index == 0 {
            return Err(self.error("argument indices are 1-based", span));
        }
        Ok((index, span))
    }

    fn parse_on_failure(&mut self) -> Result<(OnFailure, Vec<IndexRef>), SyntaxError> {
        let span = self.expect(Token::Ident, "on-failure symbol name")?;
        let symbol = self.text(span).to_string();
        self.expect(Token::LParen, "`(`")?;

        let mut args = Vec::new();
        let mut refs = Vec::new();
        if !self.eat(Token::RParen) {
            loop {
                self.expect(Token::At, "`@` argument reference")?;
                let (index, span) = self.parse_index()?;
                refs.push(IndexRef {
                    index,
                    span,
                    owner: None,
                });
                args.push(index);
                if self.eat(Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, "`,` or `)`")?;
                break;
            }
        }

        Ok((OnFailure { symbol, args }, refs))
    }

    // ====== Validation ======

    fn check_refs(&self, refs: &[IndexRef], argc: usize) -> Result<(), SyntaxError> {
        for r in refs {
            if r.index as usize > argc {
                return Err(self.error(
                    format!(
                        "argument index @{} out of range (function has {} argument{})",
                        r.index,
                        argc,
                        if argc == 1 { "" } else { "s" }
                    ),
                    r.span,
                ));
            }
            if r.owner == Some(r.index as usize - 1) {
                return Err(self.error("assertion references its own argument", r.span));
            }
        }
        Ok(())
    }

    /// Mark elided arguments and verify they carry enough information to
    /// be inferred. Beyond the explicit `-`, a mutual pair elides the
    /// scalar side: argument j with `=@i` where argument i carries
    /// `[=@j]`.
    fn mark_elided(&self, args: &mut [Ty], spans: &[Span]) -> Result<(), SyntaxError> {
        for j in 0..args.len() {
            if args[j].elided {
                continue;
            }
            let Some(assertion) = args[j].assertion else {
                continue;
            };
            if assertion.kind != AssertKind::Equality {
                continue;
            }
            let target = assertion.index as usize - 1;
            if args[target].capacity == Some(Capacity::Equals((j + 1) as u8)) {
                args[j].elided = true;
            }
        }

        for (j, arg) in args.iter().enumerate() {
            if !arg.elided {
                continue;
            }
            match arg.assertion {
                Some(a) if a.kind == AssertKind::Equality => {}
                Some(a) => {
                    return Err(self.error(
                        format!(
                            "elided argument must use an equality assertion, not `{}`",
                            a.kind.rune()
                        ),
                        spans[j],
                    ));
                }
                None => {
                    return Err(self.error(
                        "elided argument needs an `=@N` assertion to infer its value",
                        spans[j],
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let sig = parse("func()").unwrap();
        assert_eq!(sig.symbol, None);
        assert!(sig.args.is_empty());
        assert_eq!(sig.ret, None);
        assert_eq!(sig.ret_kind(), Kind::Void);
    }

    #[test]
    fn test_parse_symbol_and_scalars() {
        let sig = parse("atan2 func(double,double)double").unwrap();
        assert_eq!(sig.symbol.as_deref(), Some("atan2"));
        assert_eq!(sig.args.len(), 2);
        assert_eq!(sig.args[0].kind, Kind::F64);
        assert_eq!(sig.ret_kind(), Kind::F64);
    }

    #[test]
    fn test_parse_markers() {
        let sig = parse("puts func(#char)int").unwrap();
        assert_eq!(sig.args[0].marker, Marker::Immutable);
        assert_eq!(sig.args[0].kind, Kind::Char);
        assert!(sig.args[0].is_cstring());

        let sig = parse("func(&void)").unwrap();
        assert_eq!(sig.args[0].marker, Marker::Mutable);
        assert!(sig.args[0].is_pointer_class());
        assert!(!sig.args[0].is_cstring());
    }

    #[test]
    fn test_parse_read_descriptor_with_mutual_elision() {
        let sig = parse("read func(&void[=@2],size_t=@1,size_t)size_t").unwrap();
        assert_eq!(sig.symbol.as_deref(), Some("read"));
        assert_eq!(sig.args.len(), 3);
        assert_eq!(sig.args[0].capacity, Some(Capacity::Equals(2)));
        assert_eq!(
            sig.args[1].assertion,
            Some(Assertion {
                kind: AssertKind::Equality,
                index: 1
            })
        );
        // The size_t bound to the buffer's capacity is caller-elided.
        assert!(sig.args[1].elided);
        assert!(!sig.args[0].elided);
        assert!(!sig.args[2].elided);
        assert_eq!(sig.managed_arity(), 2);
    }

    #[test]
    fn test_parse_explicit_elision_marker() {
        let sig = parse("write func(#char,-size_t=@1)ssize_t").unwrap();
        assert!(sig.args[1].elided);
        assert_eq!(sig.managed_arity(), 1);
    }

    #[test]
    fn test_parse_return_assertion_and_on_failure() {
        let sig = parse("write func(int,#void,size_t)size_t=@3; errno()").unwrap();
        let ret = sig.ret.as_ref().unwrap();
        assert_eq!(
            ret.assertion,
            Some(Assertion {
                kind: AssertKind::Equality,
                index: 3
            })
        );
        let hook = sig.on_failure.as_ref().unwrap();
        assert_eq!(hook.symbol, "errno");
        assert!(hook.args.is_empty());
    }

    #[test]
    fn test_parse_on_failure_with_args() {
        let sig = parse("func(int,int)int=@1; explain(@1,@2)").unwrap();
        let hook = sig.on_failure.as_ref().unwrap();
        assert_eq!(hook.args, vec![1, 2]);
    }

    #[test]
    fn test_parse_nested_callback() {
        let sig = parse("qsort func(&void,size_t,size_t,func(#void,#void)int)").unwrap();
        let cb = &sig.args[3];
        assert_eq!(cb.kind, Kind::Callback);
        let nested = cb.func.as_ref().unwrap();
        assert_eq!(nested.args.len(), 2);
        assert_eq!(nested.ret_kind(), Kind::I32);
        assert_eq!(nested.code_string(), "pp)i");
    }

    #[test]
    fn test_parse_inverted_return() {
        let sig = parse("isatty func(int)!int").unwrap();
        assert!(sig.ret.as_ref().unwrap().inverted);
    }

    #[test]
    fn test_parse_struct_with_size() {
        let sig = parse("func(struct[24])").unwrap();
        assert_eq!(sig.args[0].kind, Kind::Aggregate { size: 24, align: 8 });
        let sig = parse("func(struct[3])").unwrap();
        assert_eq!(sig.args[0].kind, Kind::Aggregate { size: 3, align: 4 });
    }

    #[test]
    fn test_parse_all_assertion_runes() {
        let sig = parse("func(int/@2,int?@1,int:@1,int^@1,int~@1)").unwrap();
        let kinds: Vec<AssertKind> = sig
            .args
            .iter()
            .map(|a| a.assertion.unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                AssertKind::Indirect,
                AssertKind::OfFormat,
                AssertKind::SameType,
                AssertKind::Lifetime,
                AssertKind::Overlaps,
            ]
        );
    }

    #[test]
    fn test_error_unknown_type_name() {
        let err = parse("func(flot)").unwrap_err();
        assert!(err.to_string().contains("unknown type name `flot`"));
    }

    #[test]
    fn test_error_index_out_of_range() {
        let err = parse("func(int=@3,int)").unwrap_err();
        assert!(err.to_string().contains("@3 out of range"));
    }

    #[test]
    fn test_error_zero_index() {
        let err = parse("func(int=@0,int)").unwrap_err();
        assert!(err.to_string().contains("1-based"));
    }

    #[test]
    fn test_error_self_reference() {
        let err = parse("func(int=@1)").unwrap_err();
        assert!(err.to_string().contains("its own argument"));
    }

    #[test]
    fn test_error_multiple_assertions() {
        let err = parse("func(int=@2<@2,int)").unwrap_err();
        assert!(err.to_string().contains("multiple assertions"));
    }

    #[test]
    fn test_error_elided_without_assertion() {
        let err = parse("func(-int,int)").unwrap_err();
        assert!(err.to_string().contains("needs an `=@N` assertion"));
    }

    #[test]
    fn test_error_star_marker() {
        let err = parse("func(*char)").unwrap_err();
        assert!(err.to_string().contains("use `&`"));
    }

    #[test]
    fn test_error_variadic_not_last() {
        let err = parse("func(...,int)").unwrap_err();
        assert!(err.to_string().contains("last argument"));
    }

    #[test]
    fn test_error_trailing_tokens() {
        let err = parse("func() func()").unwrap_err();
        assert!(err.to_string().contains("after descriptor"));
    }

    #[test]
    fn test_error_truncated() {
        let err = parse("read func(").unwrap_err();
        assert!(err.to_string().contains("expected"));
    }

    #[test]
    fn test_on_failure_index_out_of_range() {
        let err = parse("func(int)int; errno(@2)").unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
