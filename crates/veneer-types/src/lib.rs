//! Veneer descriptor and signature model
//!
//! Bind-time types shared by the calling-convention engine:
//! - Descriptor grammar: `symbol func(type,type)ret=@N; onfail(@M)`
//! - Argument kinds with platform sizes
//! - Assertion rules and caller-elided argument inference
//! - Behavioral promises (bitmask)
//!
//! This crate is pure data: no unsafe, no platform calls. The engine crate
//! consumes [`Signature`] values produced by [`descriptor::parse`].

#![warn(rust_2018_idioms)]

pub mod descriptor;
pub mod error;
pub mod kind;
pub mod promise;
pub mod sig;
pub mod token;

pub use error::SyntaxError;
pub use kind::Kind;
pub use promise::Promises;
pub use sig::{AssertKind, Assertion, Capacity, Marker, OnFailure, Signature, Ty};
pub use token::{Span, Token};
