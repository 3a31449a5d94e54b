//! Response parser schemas and their compiled validators.
//!
//! Roles attach a parser to every agent reply; `user` inputs and cli/
//! workflow step inputs reuse the same machinery. A [`ParserSchema`] is a
//! compact, JSON-schema-like description; [`compile`] turns it into a
//! [`Validator`] that coerces candidates (defaults, enum checks, integer
//! rounding) or reports a structured error.

pub mod schema;
pub mod validator;

pub use schema::{
    ArraySchema, BooleanSchema, NumberSchema, ObjectSchema, ParserSchema, StringSchema,
};
pub use validator::{compile, ValidationIssue, Validator};
