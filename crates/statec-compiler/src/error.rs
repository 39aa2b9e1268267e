//! Compiler error types.
//!
//! Every error raised during the build phase carries the scope-description
//! chain of the context it was raised in, so a failure deep inside a macro
//! expansion still names the label, class and derivation it came from.
//! Errors serialize so embedding tools can consume them structurally.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The scope-description chain of a context, outermost first.
///
/// Displayed innermost-first: `macro 'poof' at label 'Spawn' at class 'Imp'`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeChain(pub Vec<String>);

impl ScopeChain {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ScopeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "the top level");
        }
        let mut first = true;
        for desc in self.0.iter().rev() {
            if !first {
                write!(f, " at ")?;
            }
            write!(f, "{desc}")?;
            first = false;
        }
        Ok(())
    }
}

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // ── Unresolved names ──
    #[error("no replacement named {0:?}")]
    UnknownReplacement(String),
    #[error("unknown macro {0:?}")]
    UnknownMacro(String),
    #[error("unknown macro {class}.{name}")]
    UnknownExternMacro { class: String, name: String },
    #[error("unknown template {0:?}")]
    UnknownTemplate(String),
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
    #[error("unknown class {0:?}")]
    UnknownClass(String),
    #[error("call to unknown function {function:?} of class {class}")]
    UnknownFunction { class: String, function: String },

    // ── Arity and shape ──
    #[error("template {template:?} expects {expected} parameters, got {got}")]
    TemplateArity {
        template: String,
        expected: usize,
        got: usize,
    },
    #[error("macro {name:?} expects {expected} arguments, got {got}")]
    MacroArity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("abstract label {name:?} of template {template:?} has no definition")]
    MissingAbstractLabel { template: String, name: String },
    #[error("abstract macro {name:?} of template {template:?} has no definition")]
    MissingAbstractMacro { template: String, name: String },
    #[error(
        "abstract macro {name:?} of template {template:?} expects {expected} arguments, got {got}"
    )]
    AbstractMacroArity {
        template: String,
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("abstract array {name:?} of template {template:?} is not defined")]
    MissingAbstractArray { template: String, name: String },
    #[error(
        "abstract array {name:?} of template {template:?} expects {expected} elements, got {got}"
    )]
    AbstractArraySize {
        template: String,
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("array {name:?} is not abstractly declared in template {template:?}")]
    UndeclaredArray { template: String, name: String },
    #[error("invalid repeat count: expected an integer, got {0:?}")]
    InvalidRepeatCount(String),
    #[error("parametrised sprite {name:?} must be bound to a quoted string, got {got:?}")]
    SpriteParameterNotString { name: String, got: String },

    // ── Structural misuse ──
    #[error("return statement outside a function")]
    MisplacedReturn,
    #[error("break statement outside a loop")]
    MisplacedBreak,
    #[error("continue statement outside a loop")]
    MisplacedContinue,
    #[error("array {0:?} is only valid inside a template derivation")]
    ArrayOutsideDerivation(String),
}

/// A structured compiler error: the failure plus where it was raised.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} in {scope}")]
pub struct CompileError {
    pub kind: ErrorKind,
    pub scope: ScopeChain,
}

impl CompileError {
    pub fn new(kind: ErrorKind, scope: ScopeChain) -> Self {
        Self { kind, scope }
    }

    /// An error raised outside any described scope.
    pub fn at_top_level(kind: ErrorKind) -> Self {
        Self {
            kind,
            scope: ScopeChain::default(),
        }
    }
}

/// Compiler result type alias.
pub type CompileResult<T> = Result<T, CompileError>;
