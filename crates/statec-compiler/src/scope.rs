//! The lexical scope tree driving the build phase.
//!
//! A [`Context`] is created per lexical construct (label, function, branch
//! body, loop body, macro expansion, template derivation). It carries name
//! replacements, macro and template registries, the shared call/actor
//! collectors of the compilation unit, and a description stack for
//! diagnostics.
//!
//! Two kinds of children exist:
//! - *local* children (`derive`) contribute to the parent's running state
//!   count;
//! - *remote* children (`remote_derive`) are tracked separately, plus a
//!   fixed extra offset, for construct bodies whose size must be known
//!   while the construct is still under construction. The builder pops a
//!   remote child as soon as the finished construct node is appended, so
//!   nothing is ever counted twice.
//!
//! State-count queries walk weak references to the statement nodes; the
//! nodes themselves are owned by their enclosing label, function or
//! construct body.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use statec_types::ast::MacroDef;

use crate::actor::{Actor, CallSite};
use crate::error::{CompileError, CompileResult, ErrorKind, ScopeChain};
use crate::stmt::Piece;
use crate::template::Template;

pub type CallList = Rc<RefCell<Vec<Rc<RefCell<CallSite>>>>>;
pub type ActorList = Rc<RefCell<Vec<Weak<RefCell<Actor>>>>>;

enum ContextEntry {
    Piece(Weak<Piece>),
    Child(Context),
}

struct ContextData {
    replacements: HashMap<String, String>,
    macros: HashMap<String, MacroDef>,
    templates: HashMap<String, Rc<RefCell<Template>>>,
    call_lists: Vec<CallList>,
    actor_lists: Vec<ActorList>,
    desc_stack: Vec<String>,
    entries: Vec<ContextEntry>,
    remote_children: Vec<Context>,
    remote_offset: usize,
}

/// A shared handle to one lexical scope.
#[derive(Clone)]
pub struct Context {
    inner: Rc<RefCell<ContextData>>,
}

impl Context {
    /// A fresh root scope with its own collectors (mostly for tests; the
    /// compiler wires shared collectors with [`Context::with_collectors`]).
    pub fn new() -> Self {
        Self::with_collectors(CallList::default(), ActorList::default())
    }

    /// A root scope collecting calls and actors into the given shared lists.
    pub fn with_collectors(calls: CallList, actors: ActorList) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ContextData {
                replacements: HashMap::new(),
                macros: HashMap::new(),
                templates: HashMap::new(),
                call_lists: vec![calls],
                actor_lists: vec![actors],
                desc_stack: Vec::new(),
                entries: Vec::new(),
                remote_children: Vec::new(),
                remote_offset: 0,
            })),
        }
    }

    fn child_data(&self, remote_offset: usize) -> ContextData {
        let data = self.inner.borrow();
        ContextData {
            replacements: data.replacements.clone(),
            macros: data.macros.clone(),
            templates: data.templates.clone(),
            call_lists: data.call_lists.clone(),
            actor_lists: data.actor_lists.clone(),
            desc_stack: data.desc_stack.clone(),
            entries: Vec::new(),
            remote_children: Vec::new(),
            remote_offset,
        }
    }

    /// Derive a local child scope; its states count towards this scope.
    pub fn derive(&self, desc: Option<&str>) -> Context {
        let mut data = self.child_data(0);
        if let Some(desc) = desc {
            data.desc_stack.push(desc.to_string());
        }
        let child = Context {
            inner: Rc::new(RefCell::new(data)),
        };
        self.inner
            .borrow_mut()
            .entries
            .push(ContextEntry::Child(child.clone()));
        child
    }

    /// Derive a remote child scope: sized independently, carrying
    /// `remote_offset` extra states for the construct scaffolding laid out
    /// around it. Pop it with [`Context::pop_remote`] once the construct
    /// node exists.
    pub fn remote_derive(&self, desc: &str, remote_offset: usize) -> Context {
        let mut data = self.child_data(remote_offset);
        data.desc_stack.push(desc.to_string());
        let child = Context {
            inner: Rc::new(RefCell::new(data)),
        };
        self.inner
            .borrow_mut()
            .remote_children
            .push(child.clone());
        child
    }

    /// Drop the most recent remote child.
    pub fn pop_remote(&self) {
        self.inner.borrow_mut().remote_children.pop();
    }

    /// Record a finished statement node in this scope (for sizing only —
    /// ownership stays with the enclosing body).
    pub fn push_piece(&self, piece: &Rc<Piece>) {
        self.inner
            .borrow_mut()
            .entries
            .push(ContextEntry::Piece(Rc::downgrade(piece)));
    }

    /// Sum of the owned statements' state counts.
    pub fn num_states(&self) -> usize {
        let data = self.inner.borrow();
        data.entries
            .iter()
            .map(|e| match e {
                ContextEntry::Piece(p) => p.upgrade().map_or(0, |p| p.num_states()),
                ContextEntry::Child(c) => c.num_states(),
            })
            .sum()
    }

    /// Like [`Context::num_states`], but including the remote offset and any
    /// remote children still under construction.
    pub fn remote_num_states(&self) -> usize {
        let data = self.inner.borrow();
        let own: usize = data
            .entries
            .iter()
            .map(|e| match e {
                ContextEntry::Piece(p) => p.upgrade().map_or(0, |p| p.num_states()),
                ContextEntry::Child(c) => c.remote_num_states(),
            })
            .sum();
        let remote: usize = data
            .remote_children
            .iter()
            .map(|c| c.remote_num_states())
            .sum();
        data.remote_offset + own + remote
    }

    // ── Descriptions ─────────────────────────────────────────────────────

    /// Push a scope description, popped when the guard drops.
    pub fn desc_scope(&self, desc: impl Into<String>) -> DescGuard {
        self.inner.borrow_mut().desc_stack.push(desc.into());
        DescGuard { ctx: self.clone() }
    }

    /// The description chain, innermost first.
    pub fn describe(&self) -> String {
        self.scope_chain().to_string()
    }

    pub fn scope_chain(&self) -> ScopeChain {
        ScopeChain(self.inner.borrow().desc_stack.clone())
    }

    /// Build an error carrying this scope's description chain.
    pub fn error(&self, kind: ErrorKind) -> CompileError {
        CompileError::new(kind, self.scope_chain())
    }

    // ── Replacements ─────────────────────────────────────────────────────

    pub fn set_replacement(&self, name: &str, value: impl Into<String>) {
        self.inner
            .borrow_mut()
            .replacements
            .insert(name.to_uppercase(), value.into());
    }

    pub fn replacement(&self, name: &str) -> Option<String> {
        self.inner
            .borrow()
            .replacements
            .get(&name.to_uppercase())
            .cloned()
    }

    /// Follow `@`-prefixed indirection through the replacements map, peeling
    /// one level per `@`. Plain names pass through untouched.
    pub fn resolve(&self, name: &str) -> CompileResult<String> {
        let mut name = name.to_string();
        while name.starts_with('@') {
            let depth = name.chars().take_while(|&c| c == '@').count();
            let bare = name[depth..].to_string();
            match self.replacement(&bare) {
                Some(value) => {
                    name = format!("{}{}", "@".repeat(depth - 1), value);
                }
                None => return Err(self.error(ErrorKind::UnknownReplacement(bare))),
            }
        }
        Ok(name)
    }

    // ── Macros and templates ─────────────────────────────────────────────

    pub fn define_macro(&self, def: MacroDef) {
        self.inner
            .borrow_mut()
            .macros
            .insert(def.name.to_uppercase(), def);
    }

    pub fn lookup_macro(&self, name: &str) -> Option<MacroDef> {
        self.inner
            .borrow()
            .macros
            .get(&name.to_uppercase())
            .cloned()
    }

    pub fn define_template(&self, template: Rc<RefCell<Template>>) {
        let name = template.borrow().name.to_uppercase();
        self.inner.borrow_mut().templates.insert(name, template);
    }

    pub fn lookup_template(&self, name: &str) -> Option<Rc<RefCell<Template>>> {
        self.inner
            .borrow()
            .templates
            .get(&name.to_uppercase())
            .cloned()
    }

    /// Merge another scope's replacements, macros and templates into this
    /// one (class inheritance, extern macro injection).
    pub fn update_from(&self, other: &Context) {
        let other = other.inner.borrow();
        let mut data = self.inner.borrow_mut();
        for (k, v) in &other.replacements {
            data.replacements.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.macros {
            data.macros.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.templates {
            data.templates.insert(k.clone(), v.clone());
        }
    }

    // ── Collectors ───────────────────────────────────────────────────────

    pub fn add_call(&self, call: &Rc<RefCell<CallSite>>) {
        for list in &self.inner.borrow().call_lists {
            list.borrow_mut().push(call.clone());
        }
    }

    pub fn add_actor(&self, actor: &Rc<RefCell<Actor>>) {
        for list in &self.inner.borrow().actor_lists {
            list.borrow_mut().push(Rc::downgrade(actor));
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard popping a scope description on drop.
pub struct DescGuard {
    ctx: Context,
}

impl Drop for DescGuard {
    fn drop(&mut self) {
        self.ctx.inner.borrow_mut().desc_stack.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmt::State;

    fn frame() -> Rc<Piece> {
        Rc::new(Piece::State(State::simple("POSS", "A", 4)))
    }

    #[test]
    fn local_children_count_towards_parent() {
        let root = Context::new();
        let child = root.derive(Some("body"));

        let a = frame();
        let b = frame();
        child.push_piece(&a);
        child.push_piece(&b);

        assert_eq!(child.num_states(), 2);
        assert_eq!(root.num_states(), 2);
    }

    #[test]
    fn remote_children_count_only_remotely() {
        let root = Context::new();
        let remote = root.remote_derive("if body", 2);

        let a = frame();
        remote.push_piece(&a);

        assert_eq!(root.num_states(), 0);
        assert_eq!(remote.remote_num_states(), 3); // offset 2 + one state
        assert_eq!(root.remote_num_states(), 3);

        root.pop_remote();
        assert_eq!(root.remote_num_states(), 0);
    }

    #[test]
    fn resolve_peels_one_indirection_level_per_at_sign() {
        let ctx = Context::new();
        ctx.set_replacement("inner", "TargetClass");
        ctx.set_replacement("outer", "@inner");

        assert_eq!(ctx.resolve("plain").unwrap(), "plain");
        assert_eq!(ctx.resolve("@inner").unwrap(), "TargetClass");
        // "@outer" resolves to "@inner", which resolves again.
        assert_eq!(ctx.resolve("@outer").unwrap(), "TargetClass");
    }

    #[test]
    fn resolve_reports_the_scope_chain() {
        let ctx = Context::new();
        let _class = ctx.desc_scope("class 'Imp'");
        let _label = ctx.desc_scope("label 'Spawn'");

        let err = ctx.resolve("@missing").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownReplacement("missing".into()));
        assert_eq!(err.scope.to_string(), "label 'Spawn' at class 'Imp'");
    }

    #[test]
    fn desc_guard_pops_on_drop() {
        let ctx = Context::new();
        {
            let _g = ctx.desc_scope("label 'Spawn'");
            assert_eq!(ctx.describe(), "label 'Spawn'");
        }
        assert_eq!(ctx.describe(), "the top level");
    }

    #[test]
    fn derived_scopes_copy_replacements_without_backflow() {
        let root = Context::new();
        root.set_replacement("X", "1");
        let child = root.derive(None);
        child.set_replacement("Y", "2");

        assert_eq!(child.replacement("x").as_deref(), Some("1"));
        assert_eq!(root.replacement("y"), None);
    }
}
