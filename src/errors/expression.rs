//! Expression transform error types

use thiserror::Error;

/// Errors from the sandboxed formula language
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// Formula is not syntactically valid
    #[error("Syntax error at {position}: {message}")]
    Syntax {
        /// Byte offset into the formula
        position: usize,
        /// What went wrong
        message: String,
    },

    /// Function is not on the allowed list
    #[error("Function '{0}' is not allowed")]
    UnknownFunction(String),

    /// Function called with the wrong number of arguments
    #[error("Function '{function}' expects {expected} argument(s), got {found}")]
    Arity {
        /// Function name
        function: String,
        /// Human readable expected count
        expected: String,
        /// Arguments supplied
        found: usize,
    },

    /// Nesting exceeds the maximum depth
    #[error("Expression nesting exceeds {0} levels")]
    TooDeep(usize),

    /// Operand has the wrong type at evaluation time
    #[error("Type error: {0}")]
    Type(String),

    /// Division or remainder by zero
    #[error("Division by zero")]
    DivisionByZero,
}

impl ExpressionError {
    /// Parse-time problems make a mapping invalid; evaluation problems only affect one row.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            ExpressionError::Syntax { .. }
                | ExpressionError::UnknownFunction(_)
                | ExpressionError::Arity { .. }
                | ExpressionError::TooDeep(_)
        )
    }
}
