//! Expression, literal and action rendering.
//!
//! Expressions are never evaluated — they are re-spelled in the target
//! dialect with replacement parameters substituted. Inline template
//! derivations encountered inside parameters derive their class here and
//! render as the quoted class name.

use statec_types::ast::{ActionCall, Expr, Literal, Parameter};

use crate::builder::Compiler;
use crate::error::CompileResult;
use crate::scope::Context;

/// Quote a string for the target dialect, unless it already is quoted.
pub fn quote(s: &str) -> String {
    if is_quoted(s) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Strip one layer of quoting, if present.
pub fn unquote(s: &str) -> &str {
    if is_quoted(s) {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn is_quoted(s: &str) -> bool {
    s.len() > 1
        && (s.starts_with('"') || s.starts_with('\''))
        && s.ends_with(s.chars().next().unwrap_or('"'))
}

/// Numbers spell as integers whenever they are whole.
pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl Compiler {
    pub(crate) fn render_expr(&mut self, expr: &Expr, ctx: &Context) -> CompileResult<String> {
        match expr {
            Expr::Chain(items) => {
                let rendered: CompileResult<Vec<String>> =
                    items.iter().map(|e| self.render_expr(e, ctx)).collect();
                Ok(rendered?.join(" "))
            }
            Expr::Literal(lit) => self.render_literal(lit, ctx),
            Expr::ArrayIndex(inner) => Ok(format!("[{}]", self.render_expr(inner, ctx)?)),
            Expr::Operator(op) => Ok(op.clone()),
            Expr::Paren(inner) => Ok(format!("({})", self.render_expr(inner, ctx)?)),
        }
    }

    fn render_literal(&mut self, lit: &Literal, ctx: &Context) -> CompileResult<String> {
        match lit {
            Literal::Number(n) => Ok(format_number(*n)),
            Literal::Text(s) => Ok(quote(s)),
            Literal::Variable(name) => Ok(ctx.replacement(name).unwrap_or_else(|| name.clone())),
            Literal::Call(call) => self.render_action(call, ctx),
            Literal::Derivation(deriv) => {
                let actor = self.derive_template(deriv, ctx, None, None)?;
                let name = actor.borrow().name.clone();
                Ok(quote(&name))
            }
        }
    }

    pub(crate) fn render_parameter(
        &mut self,
        parameter: &Parameter,
        ctx: &Context,
    ) -> CompileResult<String> {
        match parameter {
            Parameter::Expression(expr) => self.render_expr(expr, ctx),
            Parameter::Derivation(deriv) => {
                let actor = self.derive_template(deriv, ctx, None, None)?;
                let name = actor.borrow().name.clone();
                Ok(quote(&name))
            }
        }
    }

    fn render_args(&mut self, args: &[Parameter], ctx: &Context) -> CompileResult<String> {
        let rendered: CompileResult<Vec<String>> = args
            .iter()
            .map(|a| self.render_parameter(a, ctx))
            .collect();
        Ok(rendered?.join(", "))
    }

    /// An action in expression position: the name goes through the
    /// replacements map and parentheses always render.
    pub(crate) fn render_action(
        &mut self,
        call: &ActionCall,
        ctx: &Context,
    ) -> CompileResult<String> {
        let name = ctx
            .replacement(&call.name)
            .unwrap_or_else(|| call.name.clone());
        Ok(format!("{}({})", name, self.render_args(&call.args, ctx)?))
    }

    /// An action in state position: spelled verbatim, argless calls render
    /// without parentheses.
    pub(crate) fn render_state_action(
        &mut self,
        call: &ActionCall,
        ctx: &Context,
    ) -> CompileResult<String> {
        if call.args.is_empty() {
            Ok(call.name.clone())
        } else {
            Ok(format!(
                "{}({})",
                call.name,
                self.render_args(&call.args, ctx)?
            ))
        }
    }
}
