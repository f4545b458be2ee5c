// The Landtable formula language: a small expression language lexed and
// parsed here, type-checked against a table's type environment, and lowered
// to a parameterized SQL fragment. The pipeline is purely synchronous and
// performs no I/O.

pub mod ast;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod sql;

pub use ast::{BinaryOp, ConcreteType, Node, Type, TypeEnvironment, UnaryOp};
pub use functions::FunctionRegistry;
pub use lexer::{lex, Token, TokenKind};
pub use sql::{to_sql, Lowerer, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("invalid character at position {0}")]
    Lex(usize),
    #[error("unterminated string literal at position {0}")]
    UnterminatedString(usize),
    #[error("unterminated variable group at position {0}")]
    UnterminatedVariable(usize),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Type(String),
    #[error("empty formula")]
    Empty,
    /// A defect in the lowering itself rather than in the formula.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A parsed formula. The source text is retained for serialization; the AST
/// is type-checked (and annotated with casts) at the point of use, against
/// the table environment in effect there.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    code: String,
    ast: Node,
}

impl Formula {
    pub fn parse(code: impl Into<String>) -> Result<Self, FormulaError> {
        let code = code.into();
        let tokens = lexer::lex(&code)?;
        let ast = parser::parse(tokens)?.ok_or(FormulaError::Empty)?;
        Ok(Self { code, ast })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn ast(&self) -> &Node {
        &self.ast
    }
}

impl std::str::FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code)
    }
}

impl serde::Serialize for Formula {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.code)
    }
}

impl<'de> serde::Deserialize<'de> for Formula {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let code = String::deserialize(deserializer)?;
        Formula::parse(code).map_err(|err| D::Error::custom(format!("invalid formula: {err}")))
    }
}
