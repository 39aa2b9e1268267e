//! The tagged tree produced by the front-end parser.
//!
//! Node kinds mirror the source language: module-level declarations
//! (classes, class templates, groups, macros, static template derivations)
//! and, inside bodies, frame emissions and the control-flow constructs the
//! backend lowers to literal jump offsets. Everything is plain data —
//! resolution, sizing and rendering all happen in `statec-compiler`.
//!
//! All nodes derive `serde` traits so drivers can ship trees across a
//! process boundary as JSON.

use serde::{Deserialize, Serialize};

// ══════════════════════════════════════════════════════════════════════════════
// Top level
// ══════════════════════════════════════════════════════════════════════════════

/// A complete compilation input: the declarations of one source module.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Module {
    pub declarations: Vec<Declaration>,
}

/// A module-level declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Declaration {
    Class(ClassDecl),
    Template(TemplateDecl),
    Group(GroupDecl),
    Macro(MacroDef),
    /// `derive Name as Template(...) { ... }` at module level.
    StaticDerivation(StaticDerivation),
}

/// `actor Name [: Parent] [replaces Other] [1234] { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDecl {
    pub name: String,
    pub inherit: Option<InheritSpec>,
    pub replace: Option<String>,
    pub editor_number: Option<u32>,
    /// Group this class registers itself with, if any.
    pub group: Option<String>,
    pub body: Vec<ClassItem>,
}

/// A parametrized class blueprint. Abstract members are holes every
/// derivation must fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDecl {
    pub name: String,
    pub parameters: Vec<String>,
    pub inherit: Option<InheritSpec>,
    pub replace: Option<String>,
    pub editor_number: Option<u32>,
    /// Group every derived class is appended to, if any.
    pub group: Option<String>,
    pub body: Vec<ClassItem>,
}

/// A named, append-only list of class names, iterable with `for`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDecl {
    pub name: String,
    pub members: Vec<String>,
}

/// A macro: a reusable statement block with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroDef {
    pub name: String,
    pub args: Vec<String>,
    pub body: Vec<Stmt>,
}

/// A module-level template derivation producing a named class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDerivation {
    pub name: String,
    pub group: Option<String>,
    pub source: TemplateDerivation,
}

/// A template instantiation site: template name, actual parameters and the
/// override body (labels, macros and arrays filling abstract members).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDerivation {
    pub template: String,
    pub parameters: Vec<Parameter>,
    pub body: Vec<ClassItem>,
}

/// What a class inherits from: a plain class name or an inline derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritSpec {
    Class(String),
    Derivation(TemplateDerivation),
}

// ══════════════════════════════════════════════════════════════════════════════
// Class items
// ══════════════════════════════════════════════════════════════════════════════

/// One item of a class, template or derivation body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassItem {
    Property { name: String, values: Vec<Parameter> },
    Flag(String),
    AntiFlag(String),
    /// A line copied into the class header verbatim (flag combos etc.).
    Raw(String),
    UserVar(UserVarDecl),
    /// An array definition filling an abstract array of a template.
    /// Only valid inside a template derivation body.
    Array { name: String, values: Vec<Expr> },
    Label { name: String, body: Vec<Stmt> },
    Function { name: String, body: Vec<Stmt> },
    Macro(MacroDef),
    AbstractLabel(String),
    AbstractMacro { name: String, args: Vec<String> },
    AbstractArray { name: String, spec: AbstractArraySpec },
}

/// `var int health;` / `var float speeds[4] = { ... };`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserVarDecl {
    pub name: String,
    pub var_type: UserVarType,
    pub size: Option<usize>,
    pub init: Option<VarInit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVarType {
    Int,
    Float,
}

/// Initial value(s) of a user variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarInit {
    Value(Expr),
    Array(Vec<Expr>),
}

/// Declared shape of an abstract array hole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbstractArraySpec {
    pub size: ArraySize,
    pub var_type: UserVarType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArraySize {
    /// Any number of elements is accepted.
    Any,
    Fixed(usize),
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

/// A statement inside a label, function or macro body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    Frames(FramesStmt),
    /// Call a function of the same class through the marker protocol.
    Call { function: String },
    If {
        condition: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    /// Conditional whose test is itself a jump action; the compiler binds
    /// `$OFFSET` to the computed jump target when rendering `jump`.
    IfJump {
        jump: ActionCall,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    WhileJump {
        jump: ActionCall,
        body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    /// Compile-time iteration over the members of a group. The else body
    /// renders instead when the group is empty.
    For {
        item: String,
        index: Option<String>,
        group: String,
        body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    /// Compile-time unrolled repetition.
    Repeat {
        count: RepeatCount,
        index: Option<String>,
        body: Vec<Stmt>,
    },
    /// Probabilistic branch: the body runs with the given percent chance.
    Sometimes { chance: Expr, body: Vec<Stmt> },
    /// Jump to the end of the enclosing scope.
    Skip,
    Return,
    Break,
    Continue,
    /// Macro injection, optionally from another class's namespace.
    Inject {
        from_class: Option<String>,
        name: String,
        args: Vec<Parameter>,
    },
    /// Flow control copied through: `goto X`, `loop`, `stop`, `wait`, `fail`.
    Flow(String),
}

/// A frame emission: one output state per listed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramesStmt {
    pub sprite: SpriteRef,
    pub frames: Vec<String>,
    pub duration: i32,
    pub modifiers: Vec<Modifier>,
    pub action: Option<StateBody>,
}

/// A sprite name, literal or bound through a template/macro parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpriteRef {
    Name(String),
    Parametrised(String),
}

/// A state keyword such as `BRIGHT`, possibly parameter-spliced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    pub parts: Vec<ModifierPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierPart {
    Text(String),
    Replace(String),
}

/// The action part of a frame: one action, an inline block of them, or a
/// compile-time repeated block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBody {
    Action(ActionCall),
    Body(Vec<StateBody>),
    Repeated {
        count: RepeatCount,
        index: Option<String>,
        body: Vec<StateBody>,
    },
}

/// An action invocation: `A_Jump(256, 2)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub name: String,
    pub args: Vec<Parameter>,
}

/// An actual parameter: an expression or an inline template derivation
/// (which substitutes the derived class's quoted name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Expression(Expr),
    Derivation(TemplateDerivation),
}

/// A repeat count: a literal or a name resolved through replacements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatCount {
    Literal(i64),
    Name(String),
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

/// An expression, rendered back to target-dialect text by the compiler.
/// The front end does no evaluation; the tree preserves spelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A space-joined sequence of sub-expressions.
    Chain(Vec<Expr>),
    Literal(Literal),
    /// `[e]`
    ArrayIndex(Box<Expr>),
    Operator(String),
    /// `(e)`
    Paren(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Number(f64),
    Text(String),
    /// An actor variable or replacement parameter reference.
    Variable(String),
    Call(ActionCall),
    Derivation(TemplateDerivation),
}

impl Expr {
    pub fn number(value: f64) -> Self {
        Expr::Literal(Literal::Number(value))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::Text(value.into()))
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Literal(Literal::Variable(name.into()))
    }
}

impl ActionCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(name: impl Into<String>, args: Vec<Parameter>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl Parameter {
    pub fn expr(e: Expr) -> Self {
        Parameter::Expression(e)
    }
}

impl FramesStmt {
    /// Convenience for the common literal-sprite case; `frames` is split
    /// into one frame per character.
    pub fn simple(sprite: impl Into<String>, frames: &str, duration: i32) -> Self {
        Self {
            sprite: SpriteRef::Name(sprite.into()),
            frames: frames.chars().map(|c| c.to_string()).collect(),
            duration,
            modifiers: Vec::new(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: ActionCall) -> Self {
        self.action = Some(StateBody::Action(action));
        self
    }
}
