//! statec compiler backend: lowers the actor/state-machine description
//! tree to the flattened, jump-offset-based scripting dialect of the
//! target engine.
//!
//! # Architecture
//!
//! The front end (an external collaborator) produces a
//! [`statec_types::ast::Module`]; this crate turns it into script text in
//! two strictly separated phases:
//!
//! 1. **Build** — a recursive walk creating [`scope::Context`] trees and
//!    sized [`stmt::Piece`] nodes bottom-up. The target dialect has no
//!    symbolic forward labels for dynamically sized constructs, so every
//!    construct must know its exact output state count before any sibling
//!    encodes a jump across it. `break`/`continue`/`return` are rewritten
//!    into boundary-targeted skips first ([`rewrite`]), and deferred
//!    derivation work drains through a stable priority queue
//!    ([`pending`]).
//! 2. **Emission** — a single infallible rendering pass over the finished
//!    trees ([`Compiler::assemble`]).
//!
//! Calls are emulated with per-call-site marker items (the dialect has no
//! call stack); templates instantiate through a content-addressed cache.
//! All registries are owned by the [`Compiler`] — nothing is process-wide,
//! so independent compilations never interfere.

pub mod actor;
pub mod builder;
pub mod error;
pub mod exprs;
pub mod pending;
mod rewrite;
pub mod scope;
pub mod stmt;
pub mod template;

pub use builder::Compiler;
pub use error::{CompileError, CompileResult, ErrorKind, ScopeChain};

use statec_types::ast::Module;

/// Compile one module with a fresh compilation unit.
pub fn compile(module: &Module) -> CompileResult<String> {
    let mut compiler = Compiler::new();
    compiler.add_module(module)?;
    Ok(compiler.assemble())
}

/// Compile, reporting any error to `handler`. Returns `None` — and hands
/// nothing to the caller — on the first error.
pub fn compile_with_handler(
    module: &Module,
    handler: impl FnOnce(&CompileError),
) -> Option<String> {
    match compile(module) {
        Ok(text) => Some(text),
        Err(error) => {
            handler(&error);
            None
        }
    }
}
