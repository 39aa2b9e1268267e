//! Sized statement nodes.
//!
//! The build phase lowers every construct to a [`Piece`]: an immutable node
//! knowing exactly how many output states it renders. Siblings encode these
//! counts as literal jump distances, so a node's `num_states` must equal
//! the number of frame-instructions its rendered text contains — the size
//! formulas and layouts below are load-bearing, not cosmetic.
//!
//! Scaffolding states are zero-duration `TNT1 A 0` frames. Label lines and
//! flow keywords (`goto`, `stop`, …) are not states and never count towards
//! jump distances.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::actor::Function;
use crate::scope::Context;

// ── Synthesized-name helpers ─────────────────────────────────────────────

/// The state label a function body is emitted under.
pub fn func_label(name: &str) -> String {
    format!("StatecFunc_{name}")
}

/// The marker actor identifying one in-flight call.
pub fn call_marker(unit_id: &str, call_id: usize) -> String {
    format!("StatecCall_{unit_id}_{call_id}")
}

/// The landing label control returns to after a call.
pub fn call_landing(call_id: usize) -> String {
    format!("StatecCallSite_{call_id}")
}

/// A loop-entry label.
pub fn loop_label(loop_id: usize) -> String {
    format!("_loop_{loop_id}")
}

/// One epilogue probe: jump back to a call site if its marker is held.
pub fn probe_line(unit_id: &str, call_id: usize) -> String {
    format!(
        "TNT1 A 0 A_JumpIfInventory(\"{}\", 1, \"{}\")",
        call_marker(unit_id, call_id),
        call_landing(call_id)
    )
}

// ── Nodes ────────────────────────────────────────────────────────────────

/// A single output state: sprite, frame, duration, keywords, action.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub sprite: String,
    pub frame: String,
    pub duration: i32,
    pub keywords: Vec<String>,
    pub action: Option<String>,
}

impl State {
    pub fn new(
        sprite: impl Into<String>,
        frame: impl Into<String>,
        duration: i32,
        keywords: Vec<String>,
        action: Option<String>,
    ) -> Self {
        Self {
            sprite: sprite.into(),
            frame: frame.into(),
            duration,
            keywords,
            action,
        }
    }

    pub fn simple(sprite: impl Into<String>, frame: impl Into<String>, duration: i32) -> Self {
        Self::new(sprite, frame, duration, Vec::new(), None)
    }

    /// An invisible zero-duration state carrying an action.
    pub fn scaffold(action: impl Into<String>) -> Self {
        Self::new("TNT1", "A", 0, Vec::new(), Some(action.into()))
    }

    fn render_line(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.sprite.to_uppercase(),
            self.frame.to_uppercase(),
            self.duration
        );
        for kw in &self.keywords {
            line.push(' ');
            line.push_str(kw);
        }
        if let Some(action) = &self.action {
            line.push(' ');
            line.push_str(action);
        }
        line
    }
}

/// `if`: forward jump over the taken branch.
#[derive(Clone)]
pub struct IfPiece {
    pub condition: String,
    pub then_body: Vec<Rc<Piece>>,
    pub else_body: Option<Vec<Rc<Piece>>>,
}

/// `ifjump`: the test is a caller-supplied action already rendered with its
/// jump offset bound, so the true-branch entry needs its own jump state.
#[derive(Clone)]
pub struct IfJumpPiece {
    pub entry: String,
    pub then_body: Vec<Rc<Piece>>,
    pub else_body: Option<Vec<Rc<Piece>>>,
}

/// `while`: entry test, loop label, body, conditional back-jump.
#[derive(Clone)]
pub struct WhilePiece {
    pub condition: String,
    pub loop_label: String,
    pub body: Vec<Rc<Piece>>,
    pub else_body: Option<Vec<Rc<Piece>>>,
}

/// `whilejump`: generator-driven variant of [`WhilePiece`]; entry and
/// back-jump tests come pre-rendered with their targets bound.
#[derive(Clone)]
pub struct WhileJumpPiece {
    pub entry: String,
    pub back: String,
    pub loop_label: String,
    pub body: Vec<Rc<Piece>>,
    pub else_body: Option<Vec<Rc<Piece>>>,
}

/// `sometimes`: the body runs with the given percent chance.
#[derive(Clone)]
pub struct SometimesPiece {
    pub chance: String,
    pub body: Vec<Rc<Piece>>,
}

/// A jump to the end of a scope. The distance is read off the target
/// context at render time, when the target is fully built.
#[derive(Clone)]
pub struct SkipPiece {
    pub target: Context,
    /// The target's remote state count when this skip was created.
    pub index: usize,
}

/// A function call: give the marker, jump to the function label, land.
#[derive(Clone)]
pub struct CallPiece {
    pub call_id: usize,
    pub unit_id: Rc<str>,
    pub function: String,
}

/// `return`: the probe block of the enclosing function plus a stop.
/// Sized lazily — call sites keep registering until the build phase ends.
#[derive(Clone)]
pub struct ReturnPiece {
    pub function: Weak<RefCell<Function>>,
    pub unit_id: Rc<str>,
}

/// A sized statement node.
#[derive(Clone)]
pub enum Piece {
    State(State),
    /// Verbatim flow line (`goto X`, `stop`, …); zero states.
    Raw(String),
    If(IfPiece),
    IfJump(IfJumpPiece),
    While(WhilePiece),
    WhileJump(WhileJumpPiece),
    Sometimes(SometimesPiece),
    Skip(SkipPiece),
    Call(CallPiece),
    Return(ReturnPiece),
}

fn body_states(body: &[Rc<Piece>]) -> usize {
    body.iter().map(|p| p.num_states()).sum()
}

fn render_body(body: &[Rc<Piece>], lines: &mut Vec<String>) {
    for piece in body {
        piece.render(lines);
    }
}

impl Piece {
    /// The exact number of frame-instructions this node renders.
    pub fn num_states(&self) -> usize {
        match self {
            Piece::State(_) => 1,
            Piece::Raw(_) => 0,
            Piece::If(p) => match &p.else_body {
                Some(els) => body_states(&p.then_body) + body_states(els) + 3,
                None => body_states(&p.then_body) + 2,
            },
            Piece::IfJump(p) => match &p.else_body {
                Some(els) => body_states(&p.then_body) + body_states(els) + 3,
                None => body_states(&p.then_body) + 3,
            },
            Piece::While(p) => match &p.else_body {
                Some(els) => body_states(&p.body) + body_states(els) + 4,
                None => body_states(&p.body) + 3,
            },
            Piece::WhileJump(p) => match &p.else_body {
                Some(els) => body_states(&p.body) + body_states(els) + 4,
                None => body_states(&p.body) + 4,
            },
            Piece::Sometimes(p) => body_states(&p.body) + 2,
            Piece::Skip(_) => 1,
            Piece::Call(_) => 3,
            Piece::Return(p) => p
                .function
                .upgrade()
                .map_or(0, |f| f.borrow().calls.len()),
        }
    }

    /// Append this node's output lines. Lines ending in `:` are labels.
    pub fn render(&self, lines: &mut Vec<String>) {
        match self {
            Piece::State(s) => lines.push(s.render_line()),
            Piece::Raw(raw) => lines.push(raw.clone()),

            Piece::If(p) => match &p.else_body {
                None => {
                    lines.push(format!(
                        "TNT1 A 0 A_JumpIf(!({}), {})",
                        p.condition,
                        body_states(&p.then_body) + 1
                    ));
                    render_body(&p.then_body, lines);
                    lines.push("TNT1 A 0".into());
                }
                Some(els) => {
                    lines.push(format!(
                        "TNT1 A 0 A_JumpIf({}, {})",
                        p.condition,
                        body_states(els) + 2
                    ));
                    render_body(els, lines);
                    lines.push(format!(
                        "TNT1 A 0 A_Jump(256, {})",
                        body_states(&p.then_body) + 1
                    ));
                    render_body(&p.then_body, lines);
                    lines.push("TNT1 A 0".into());
                }
            },

            Piece::IfJump(p) => {
                lines.push(format!("TNT1 A 0 {}", p.entry));
                if let Some(els) = &p.else_body {
                    render_body(els, lines);
                }
                lines.push(format!(
                    "TNT1 A 0 A_Jump(256, {})",
                    body_states(&p.then_body) + 1
                ));
                render_body(&p.then_body, lines);
                lines.push("TNT1 A 0".into());
            }

            Piece::While(p) => match &p.else_body {
                None => {
                    lines.push(format!(
                        "TNT1 A 0 A_JumpIf(!({}), {})",
                        p.condition,
                        body_states(&p.body) + 2
                    ));
                    lines.push(format!("{}:", p.loop_label));
                    render_body(&p.body, lines);
                    lines.push(format!(
                        "TNT1 A 0 A_JumpIf({}, \"{}\")",
                        p.condition, p.loop_label
                    ));
                    lines.push("TNT1 A 0".into());
                }
                Some(els) => {
                    lines.push(format!(
                        "TNT1 A 0 A_JumpIf({}, {})",
                        p.condition,
                        body_states(els) + 2
                    ));
                    render_body(els, lines);
                    lines.push(format!(
                        "TNT1 A 0 A_Jump(256, {})",
                        body_states(&p.body) + 2
                    ));
                    lines.push(format!("{}:", p.loop_label));
                    render_body(&p.body, lines);
                    lines.push(format!(
                        "TNT1 A 0 A_JumpIf({}, \"{}\")",
                        p.condition, p.loop_label
                    ));
                    lines.push("TNT1 A 0".into());
                }
            },

            Piece::WhileJump(p) => {
                lines.push(format!("TNT1 A 0 {}", p.entry));
                if let Some(els) = &p.else_body {
                    render_body(els, lines);
                }
                lines.push(format!(
                    "TNT1 A 0 A_Jump(256, {})",
                    body_states(&p.body) + 2
                ));
                lines.push(format!("{}:", p.loop_label));
                render_body(&p.body, lines);
                lines.push(format!("TNT1 A 0 {}", p.back));
                lines.push("TNT1 A 0".into());
            }

            Piece::Sometimes(p) => {
                lines.push(format!(
                    "TNT1 A 0 A_Jump(256-(256*({})/100), {})",
                    p.chance,
                    body_states(&p.body) + 1
                ));
                render_body(&p.body, lines);
                lines.push("TNT1 A 0".into());
            }

            Piece::Skip(p) => {
                let total = p.target.remote_num_states();
                let distance = (total + 1).saturating_sub(p.index).max(1);
                lines.push(format!("TNT1 A 0 A_Jump(256, {distance})"));
            }

            Piece::Call(p) => {
                let marker = call_marker(&p.unit_id, p.call_id);
                lines.push(format!("TNT1 A 0 A_GiveInventory(\"{marker}\")"));
                lines.push(format!(
                    "TNT1 A 0 A_Jump(256, \"{}\")",
                    func_label(&p.function)
                ));
                lines.push(format!("{}:", call_landing(p.call_id)));
                lines.push(format!("TNT1 A 0 A_TakeInventory(\"{marker}\")"));
            }

            Piece::Return(p) => {
                if let Some(func) = p.function.upgrade() {
                    for call_id in &func.borrow().calls {
                        lines.push(probe_line(&p.unit_id, *call_id));
                    }
                }
                lines.push("Stop".into());
            }
        }
    }
}
