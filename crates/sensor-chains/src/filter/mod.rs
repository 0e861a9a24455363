//! Packet Filter Compiler
//!
//! Compiles pcap-style expressions into a predicate tree evaluated over the
//! decoded frame. Compilation happens once, when the chain is built.

mod parser;
mod program;

pub use program::{Dir, Expr, Primitive, Proto};

use crate::{ChainError, Result};
use sensor_common::FrameView;

/// Compiled filter expression
#[derive(Debug, Clone)]
pub struct FilterProgram {
    expression: String,
    expr: Expr,
}

impl FilterProgram {
    /// Compile an expression
    pub fn compile(expression: &str) -> Result<Self> {
        let expr = parser::parse_expression(expression).map_err(|reason| ChainError::InvalidFilter {
            expression: expression.to_string(),
            reason,
        })?;

        Ok(Self {
            expression: expression.to_string(),
            expr,
        })
    }

    /// Source text
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Run the program over a frame
    #[inline]
    pub fn matches(&self, frame: &FrameView<'_>) -> bool {
        self.expr.eval(frame)
    }

    /// Run the program over raw bytes; undecodable frames never match
    pub fn matches_bytes(&self, data: &[u8]) -> bool {
        FrameView::parse(data).map_or(false, |frame| self.matches(&frame))
    }
}
