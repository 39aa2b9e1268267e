//! Parametrized class templates.
//!
//! A template is registered once and derived possibly many times. A
//! derivation without abstract members is memoized by its parameter tuple;
//! abstract members force a fresh class per call site, with a
//! content-addressed name so textually identical derivations still get
//! distinct classes.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use sha2::{Digest, Sha256};
use statec_types::ast::{AbstractArraySpec, ArraySize, ClassItem, TemplateDecl};

use crate::actor::Actor;
use crate::error::{CompileResult, ErrorKind};
use crate::scope::Context;

/// How many hex digits of the content hash go into a derived class name.
const NAME_HASH_LEN: usize = 32;

pub struct Template {
    pub name: String,
    /// Per-unit instance id, part of the derived-name hash.
    pub id: String,
    pub parameters: Vec<String>,
    pub abstract_labels: BTreeSet<String>,
    /// Abstract macro name → formal argument names.
    pub abstract_macros: BTreeMap<String, Vec<String>>,
    pub abstract_arrays: BTreeMap<String, AbstractArraySpec>,
    pub group: Option<String>,
    pub inherit: Option<String>,
    pub replace: Option<String>,
    pub editor_number: Option<u32>,
    /// The unexpanded body, parsed anew for every derivation.
    pub body: Vec<ClassItem>,
    memo: HashMap<Vec<String>, Weak<RefCell<Actor>>>,
}

impl Template {
    /// Build a registry entry from a declaration, splitting the abstract
    /// member requirements out of the body.
    pub fn from_decl(decl: &TemplateDecl, inherit: Option<String>, id: String) -> Self {
        let mut abstract_labels = BTreeSet::new();
        let mut abstract_macros = BTreeMap::new();
        let mut abstract_arrays = BTreeMap::new();

        for item in &decl.body {
            match item {
                ClassItem::AbstractLabel(name) => {
                    abstract_labels.insert(name.to_uppercase());
                }
                ClassItem::AbstractMacro { name, args } => {
                    abstract_macros.insert(name.to_uppercase(), args.clone());
                }
                ClassItem::AbstractArray { name, spec } => {
                    abstract_arrays.insert(name.to_uppercase(), spec.clone());
                }
                _ => {}
            }
        }

        Self {
            name: decl.name.clone(),
            id,
            parameters: decl.parameters.clone(),
            abstract_labels,
            abstract_macros,
            abstract_arrays,
            group: decl.group.clone(),
            inherit,
            replace: decl.replace.clone(),
            editor_number: decl.editor_number,
            body: decl.body.clone(),
            memo: HashMap::new(),
        }
    }

    /// Whether derivations must be unique per call site.
    pub fn is_abstract(&self) -> bool {
        !self.abstract_labels.is_empty()
            || !self.abstract_macros.is_empty()
            || !self.abstract_arrays.is_empty()
    }

    /// The generated class name for one derivation: a stable hash over the
    /// template identity, a fresh per-call id and all parameter content.
    pub fn generated_name(&self, parameter_values: &[String], fresh_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.id.as_bytes());
        hasher.update(fresh_id.as_bytes());
        for value in parameter_values {
            hasher.update(value.as_bytes());
        }
        for label in &self.abstract_labels {
            hasher.update(label.as_bytes());
        }
        for (name, args) in &self.abstract_macros {
            hasher.update(name.as_bytes());
            for arg in args {
                hasher.update(arg.as_bytes());
            }
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(NAME_HASH_LEN);
        for byte in digest.iter().take(NAME_HASH_LEN / 2) {
            use std::fmt::Write as _;
            let _ = write!(hex, "{byte:02x}");
        }
        format!("{}__deriv_{}", self.name, hex)
    }

    /// The memoized actor for a parameter tuple, if it is still alive.
    pub fn memoized(&self, parameter_values: &[String]) -> Option<Rc<RefCell<Actor>>> {
        self.memo
            .get(parameter_values)
            .and_then(|weak| weak.upgrade())
    }

    pub fn memoize(&mut self, parameter_values: Vec<String>, actor: &Rc<RefCell<Actor>>) {
        self.memo.insert(parameter_values, Rc::downgrade(actor));
    }

    /// Validate that a derivation body satisfies every abstract member.
    ///
    /// `labels` holds override label names, `macros` maps override macro
    /// names to their arity, `arrays` maps override array names to their
    /// element count — all upper-cased.
    pub fn check_overrides(
        &self,
        ctx: &Context,
        labels: &BTreeSet<String>,
        macros: &BTreeMap<String, usize>,
        arrays: &BTreeMap<String, usize>,
    ) -> CompileResult<()> {
        for label in &self.abstract_labels {
            if !labels.contains(label) {
                return Err(ctx.error(ErrorKind::MissingAbstractLabel {
                    template: self.name.clone(),
                    name: label.clone(),
                }));
            }
        }
        for (name, args) in &self.abstract_macros {
            match macros.get(name) {
                None => {
                    return Err(ctx.error(ErrorKind::MissingAbstractMacro {
                        template: self.name.clone(),
                        name: name.clone(),
                    }));
                }
                Some(&got) if got != args.len() => {
                    return Err(ctx.error(ErrorKind::AbstractMacroArity {
                        template: self.name.clone(),
                        name: name.clone(),
                        expected: args.len(),
                        got,
                    }));
                }
                Some(_) => {}
            }
        }
        for (name, spec) in &self.abstract_arrays {
            match arrays.get(name) {
                None => {
                    return Err(ctx.error(ErrorKind::MissingAbstractArray {
                        template: self.name.clone(),
                        name: name.clone(),
                    }));
                }
                Some(&got) => {
                    if let ArraySize::Fixed(expected) = spec.size {
                        if got != expected {
                            return Err(ctx.error(ErrorKind::AbstractArraySize {
                                template: self.name.clone(),
                                name: name.clone(),
                                expected,
                                got,
                            }));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
