//! The jump-boundary rewrite pass.
//!
//! `break`, `continue` and `return` have no direct encoding in the target
//! dialect; they become skips to a statically known scope boundary. Before
//! a loop body or macro body is sized, it is rewritten into a tree whose
//! skip nodes carry an explicit target context:
//!
//! - the *loop* rewrite maps `break`/`continue` to the loop's break and
//!   iteration contexts. It recurses into branch bodies but not into nested
//!   loops — those bind their own jumps when they are built.
//! - the *macro* rewrite maps `return` to the injection context, and does
//!   recurse through loops: a `return` inside a loop inside a macro leaves
//!   the whole injected block, not the loop.
//!
//! Rewriting is strictly separate from sizing and rendering: the builder
//! consumes the rewritten tree and never inspects raw `Break`/`Continue`/
//! `Return` nodes except to reject misplaced ones.

use statec_types::ast::{ActionCall, Expr, RepeatCount, Stmt};

use crate::scope::Context;

/// A statement after lifting, with rewritable jumps made explicit.
#[derive(Clone)]
pub(crate) enum Rewritten {
    /// An untouched leaf statement.
    Keep(Stmt),
    /// A jump to the end of the given scope.
    Skip(Context),
    If {
        condition: Expr,
        then_body: Vec<Rewritten>,
        else_body: Option<Vec<Rewritten>>,
    },
    IfJump {
        jump: ActionCall,
        then_body: Vec<Rewritten>,
        else_body: Option<Vec<Rewritten>>,
    },
    Sometimes {
        chance: Expr,
        body: Vec<Rewritten>,
    },
    While {
        condition: Expr,
        body: Vec<Rewritten>,
        else_body: Option<Vec<Rewritten>>,
    },
    WhileJump {
        jump: ActionCall,
        body: Vec<Rewritten>,
        else_body: Option<Vec<Rewritten>>,
    },
    For {
        item: String,
        index: Option<String>,
        group: String,
        body: Vec<Rewritten>,
        else_body: Option<Vec<Rewritten>>,
    },
    Repeat {
        count: RepeatCount,
        index: Option<String>,
        body: Vec<Rewritten>,
    },
}

/// Lift a front-end body into the rewritable tree. Containers are
/// decomposed so later rewrites can reach into them; leaves stay as-is.
pub(crate) fn lift(stmts: &[Stmt]) -> Vec<Rewritten> {
    stmts.iter().map(lift_one).collect()
}

fn lift_opt(stmts: &Option<Vec<Stmt>>) -> Option<Vec<Rewritten>> {
    stmts.as_ref().map(|body| lift(body))
}

fn lift_one(stmt: &Stmt) -> Rewritten {
    match stmt {
        Stmt::If {
            condition,
            then_body,
            else_body,
        } => Rewritten::If {
            condition: condition.clone(),
            then_body: lift(then_body),
            else_body: lift_opt(else_body),
        },
        Stmt::IfJump {
            jump,
            then_body,
            else_body,
        } => Rewritten::IfJump {
            jump: jump.clone(),
            then_body: lift(then_body),
            else_body: lift_opt(else_body),
        },
        Stmt::Sometimes { chance, body } => Rewritten::Sometimes {
            chance: chance.clone(),
            body: lift(body),
        },
        Stmt::While {
            condition,
            body,
            else_body,
        } => Rewritten::While {
            condition: condition.clone(),
            body: lift(body),
            else_body: lift_opt(else_body),
        },
        Stmt::WhileJump {
            jump,
            body,
            else_body,
        } => Rewritten::WhileJump {
            jump: jump.clone(),
            body: lift(body),
            else_body: lift_opt(else_body),
        },
        Stmt::For {
            item,
            index,
            group,
            body,
            else_body,
        } => Rewritten::For {
            item: item.clone(),
            index: index.clone(),
            group: group.clone(),
            body: lift(body),
            else_body: lift_opt(else_body),
        },
        Stmt::Repeat { count, index, body } => Rewritten::Repeat {
            count: count.clone(),
            index: index.clone(),
            body: lift(body),
        },
        other => Rewritten::Keep(other.clone()),
    }
}

/// Bind `break`/`continue` in a loop body to the loop's boundaries.
/// Branch bodies are entered; nested loops are not.
pub(crate) fn rewrite_loop(
    body: Vec<Rewritten>,
    break_ctx: &Context,
    continue_ctx: &Context,
) -> Vec<Rewritten> {
    body.into_iter()
        .map(|stmt| rewrite_loop_one(stmt, break_ctx, continue_ctx))
        .collect()
}

fn rewrite_loop_one(stmt: Rewritten, break_ctx: &Context, continue_ctx: &Context) -> Rewritten {
    match stmt {
        Rewritten::Keep(Stmt::Break) => Rewritten::Skip(break_ctx.clone()),
        Rewritten::Keep(Stmt::Continue) => Rewritten::Skip(continue_ctx.clone()),
        Rewritten::If {
            condition,
            then_body,
            else_body,
        } => Rewritten::If {
            condition,
            then_body: rewrite_loop(then_body, break_ctx, continue_ctx),
            else_body: else_body.map(|b| rewrite_loop(b, break_ctx, continue_ctx)),
        },
        Rewritten::IfJump {
            jump,
            then_body,
            else_body,
        } => Rewritten::IfJump {
            jump,
            then_body: rewrite_loop(then_body, break_ctx, continue_ctx),
            else_body: else_body.map(|b| rewrite_loop(b, break_ctx, continue_ctx)),
        },
        Rewritten::Sometimes { chance, body } => Rewritten::Sometimes {
            chance,
            body: rewrite_loop(body, break_ctx, continue_ctx),
        },
        other => other,
    }
}

/// Bind `return` in an injected macro body to the injection boundary.
/// Unlike the loop rewrite, this one recurses through loops too.
pub(crate) fn rewrite_macro(body: Vec<Rewritten>, end_ctx: &Context) -> Vec<Rewritten> {
    body.into_iter()
        .map(|stmt| rewrite_macro_one(stmt, end_ctx))
        .collect()
}

fn rewrite_macro_one(stmt: Rewritten, end_ctx: &Context) -> Rewritten {
    match stmt {
        Rewritten::Keep(Stmt::Return) => Rewritten::Skip(end_ctx.clone()),
        Rewritten::If {
            condition,
            then_body,
            else_body,
        } => Rewritten::If {
            condition,
            then_body: rewrite_macro(then_body, end_ctx),
            else_body: else_body.map(|b| rewrite_macro(b, end_ctx)),
        },
        Rewritten::IfJump {
            jump,
            then_body,
            else_body,
        } => Rewritten::IfJump {
            jump,
            then_body: rewrite_macro(then_body, end_ctx),
            else_body: else_body.map(|b| rewrite_macro(b, end_ctx)),
        },
        Rewritten::Sometimes { chance, body } => Rewritten::Sometimes {
            chance,
            body: rewrite_macro(body, end_ctx),
        },
        Rewritten::While {
            condition,
            body,
            else_body,
        } => Rewritten::While {
            condition,
            body: rewrite_macro(body, end_ctx),
            else_body: else_body.map(|b| rewrite_macro(b, end_ctx)),
        },
        Rewritten::WhileJump {
            jump,
            body,
            else_body,
        } => Rewritten::WhileJump {
            jump,
            body: rewrite_macro(body, end_ctx),
            else_body: else_body.map(|b| rewrite_macro(b, end_ctx)),
        },
        Rewritten::For {
            item,
            index,
            group,
            body,
            else_body,
        } => Rewritten::For {
            item,
            index,
            group,
            body: rewrite_macro(body, end_ctx),
            else_body: else_body.map(|b| rewrite_macro(b, end_ctx)),
        },
        Rewritten::Repeat { count, index, body } => Rewritten::Repeat {
            count,
            index,
            body: rewrite_macro(body, end_ctx),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statec_types::ast::Expr;

    fn is_skip(stmt: &Rewritten) -> bool {
        matches!(stmt, Rewritten::Skip(_))
    }

    #[test]
    fn loop_rewrite_binds_break_and_continue() {
        let body = lift(&[Stmt::Break, Stmt::Continue]);
        let break_ctx = Context::new();
        let continue_ctx = Context::new();
        let out = rewrite_loop(body, &break_ctx, &continue_ctx);
        assert!(out.iter().all(is_skip));
    }

    #[test]
    fn loop_rewrite_enters_branches_but_not_nested_loops() {
        let body = lift(&[
            Stmt::If {
                condition: Expr::var("c"),
                then_body: vec![Stmt::Break],
                else_body: None,
            },
            Stmt::While {
                condition: Expr::var("d"),
                body: vec![Stmt::Break],
                else_body: None,
            },
        ]);
        let ctx = Context::new();
        let out = rewrite_loop(body, &ctx, &ctx);

        match &out[0] {
            Rewritten::If { then_body, .. } => assert!(is_skip(&then_body[0])),
            _ => panic!("expected if"),
        }
        // The inner loop's break is left for the inner loop to bind.
        match &out[1] {
            Rewritten::While { body, .. } => {
                assert!(matches!(body[0], Rewritten::Keep(Stmt::Break)))
            }
            _ => panic!("expected while"),
        }
    }

    #[test]
    fn macro_rewrite_reaches_returns_inside_loops() {
        let body = lift(&[Stmt::While {
            condition: Expr::var("c"),
            body: vec![Stmt::Return, Stmt::Break],
            else_body: None,
        }]);
        let ctx = Context::new();
        let out = rewrite_macro(body, &ctx);

        match &out[0] {
            Rewritten::While { body, .. } => {
                assert!(is_skip(&body[0]));
                // break is none of the macro rewrite's business
                assert!(matches!(body[1], Rewritten::Keep(Stmt::Break)));
            }
            _ => panic!("expected while"),
        }
    }
}
