//! # Cypher Language
//!
//! Tokenizer + recursive-descent parser producing a clean AST.
//! Pure functions — no I/O, no state, no storage dependency.
//!
//! Keywords are recognized on whole identifier tokens only: `RemoveReturn`
//! is a perfectly good label, never a REMOVE followed by a RETURN.

pub mod ast;
pub mod lexer;
pub mod parser;

use crate::{Error, Result};
use ast::Statement;

/// Parse a Cypher query string into an AST. Syntax errors carry the byte
/// offset plus a human-readable line:column rendering.
pub fn parse(query: &str) -> Result<Statement> {
    let run = || -> Result<Statement> {
        let tokens = lexer::tokenize(query)?;
        parser::parse_statement(&tokens)
    };
    run().map_err(|e| match e {
        Error::SyntaxError { position, message } => {
            let (line, column) = line_col(query, position);
            Error::SyntaxError {
                position,
                message: format!("{message} (line {line}, column {column})"),
            }
        }
        other => other,
    })
}

/// 1-based line and column of a byte offset.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut column = 1;
    for (i, c) in source.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_line_col() {
        let err = parse("MATCH (n:Person)\nRETURN @").unwrap_err();
        match err {
            Error::SyntaxError { message, .. } => {
                assert!(message.contains("line 2"), "{message}");
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }
}
