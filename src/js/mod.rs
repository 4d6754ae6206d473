//! JavaScript for property scripts. Scripts are parsed with tree-sitter,
//! lowered to a typed AST with a visitor, and run by a tree-walking
//! interpreter.

pub mod ast;
pub mod eval;
pub mod parser;

/// Source position of a syntax error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    /// 1-based line.
    pub line: u32,
    /// 1-based column, in characters.
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({}:{})", pos.line, pos.col)]
pub struct SyntaxError {
    pub message: String,
    pub pos: Pos,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

/// Parses `src` as the body of an async function.
pub fn parse_function_body(src: &str) -> Result<Vec<ast::Stmt>, SyntaxError> {
    parser::parse_body(src)
}
