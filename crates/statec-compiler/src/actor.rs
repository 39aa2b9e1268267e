//! Actors, labels, functions and final text assembly.
//!
//! An [`Actor`] aggregates everything a class declaration produced:
//! properties, flags, user variables, raw header lines and the sized state
//! trees of its labels and functions. Rendering is a pure walk over the
//! already-sized trees — every fallible lookup happened during the build
//! phase.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::rc::{Rc, Weak};

use statec_types::ast::UserVarType;

use crate::scope::Context;
use crate::stmt::{func_label, probe_line, Piece, State};

fn var_setter(var_type: UserVarType) -> &'static str {
    match var_type {
        UserVarType::Int => "A_SetUserVar",
        UserVarType::Float => "A_SetUserVarFloat",
    }
}

fn array_setter(var_type: UserVarType) -> &'static str {
    match var_type {
        UserVarType::Int => "A_SetUserArray",
        UserVarType::Float => "A_SetUserArrayFloat",
    }
}

fn type_keyword(var_type: UserVarType) -> &'static str {
    match var_type {
        UserVarType::Int => "int",
        UserVarType::Float => "float",
    }
}

/// A rendered class property.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: String,
}

/// Initial value(s) of a user variable, already rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum UserVarInit {
    Value(String),
    Array(Vec<String>),
}

/// A user variable declaration on an actor.
#[derive(Debug, Clone, PartialEq)]
pub struct UserVar {
    pub name: String,
    pub var_type: UserVarType,
    pub size: Option<usize>,
    pub init: Option<UserVarInit>,
}

impl UserVar {
    fn declared_size(&self) -> Option<usize> {
        self.size.or(match &self.init {
            Some(UserVarInit::Array(values)) => Some(values.len()),
            _ => None,
        })
    }

    /// The spawn-prelude states initializing this variable, if any.
    fn init_states(&self) -> Vec<Rc<Piece>> {
        match &self.init {
            None => Vec::new(),
            Some(UserVarInit::Value(value)) => {
                vec![Rc::new(Piece::State(State::scaffold(format!(
                    "{}(\"{}\", {})",
                    var_setter(self.var_type),
                    self.name,
                    value
                ))))]
            }
            Some(UserVarInit::Array(values)) => values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    Rc::new(Piece::State(State::scaffold(format!(
                        "{}(\"{}\", {}, {})",
                        array_setter(self.var_type),
                        self.name,
                        i,
                        v
                    ))))
                })
                .collect(),
        }
    }
}

/// A state label and its sized body.
pub struct Label {
    pub name: String,
    pub pieces: Vec<Rc<Piece>>,
}

/// A function: a shared label plus the call sites registered against it.
pub struct Function {
    pub name: String,
    pub id: usize,
    pub unit_id: Rc<str>,
    pub pieces: Vec<Rc<Piece>>,
    /// Call-site ids in registration order; the epilogue probes them all.
    pub calls: Vec<usize>,
}

impl Function {
    pub fn new(name: impl Into<String>, id: usize, unit_id: Rc<str>) -> Self {
        Self {
            name: name.into(),
            id,
            unit_id,
            pieces: Vec::new(),
            calls: Vec::new(),
        }
    }

    pub fn label_name(&self) -> String {
        func_label(&self.name)
    }

    fn render_lines(&self, lines: &mut Vec<String>) {
        lines.push(format!("{}:", self.label_name()));
        for piece in &self.pieces {
            piece.render(lines);
        }
        for call_id in &self.calls {
            lines.push(probe_line(&self.unit_id, *call_id));
        }
        lines.push("TNT1 A -1".into());
        lines.push("Stop".into());
    }
}

/// One call site awaiting resolution against its function.
pub struct CallSite {
    pub id: usize,
    pub function: String,
    pub actor: Weak<RefCell<Actor>>,
}

/// A compiled actor class.
pub struct Actor {
    pub name: String,
    pub inherit: Option<String>,
    pub replace: Option<String>,
    pub editor_number: Option<u32>,
    pub context: Context,
    pub properties: Vec<Property>,
    pub flags: BTreeSet<String>,
    pub antiflags: BTreeSet<String>,
    pub uservars: Vec<UserVar>,
    pub labels: Vec<Rc<RefCell<Label>>>,
    pub funcs: Vec<Rc<RefCell<Function>>>,
    pub raw: Vec<String>,
    /// Function ids continue from the inherited class's numbering.
    pub func_id_base: usize,
}

impl Actor {
    pub fn new(name: impl Into<String>, context: Context) -> Self {
        Self {
            name: name.into(),
            inherit: None,
            replace: None,
            editor_number: None,
            context,
            properties: Vec::new(),
            flags: BTreeSet::new(),
            antiflags: BTreeSet::new(),
            uservars: Vec::new(),
            labels: Vec::new(),
            funcs: Vec::new(),
            raw: Vec::new(),
            func_id_base: 0,
        }
    }

    pub fn function(&self, name: &str) -> Option<Rc<RefCell<Function>>> {
        self.funcs
            .iter()
            .find(|f| f.borrow().name == name)
            .cloned()
    }

    fn spawn_label(&self) -> Option<Rc<RefCell<Label>>> {
        self.labels
            .iter()
            .find(|l| l.borrow().name.eq_ignore_ascii_case("spawn"))
            .cloned()
    }

    /// Enforce the spawn invariant: classes with user variables get a
    /// synthesized or prefixed spawn entry point whose initialization
    /// states run ahead of any user-authored spawn code.
    pub fn prepare_spawn(&mut self) {
        let spawn = self.spawn_label();

        if !self.uservars.is_empty() {
            let label = match spawn {
                Some(label) => label,
                None => {
                    let fallthrough = if self.inherit.is_some() {
                        "goto Super::Spawn"
                    } else {
                        "stop"
                    };
                    let label = Rc::new(RefCell::new(Label {
                        name: "Spawn".into(),
                        pieces: vec![Rc::new(Piece::Raw(fallthrough.into()))],
                    }));
                    self.labels.push(label.clone());
                    label
                }
            };

            let mut pieces = vec![Rc::new(Piece::State(State::simple("TNT1", "A", 0)))];
            for var in &self.uservars {
                pieces.extend(var.init_states());
            }
            let mut label = label.borrow_mut();
            pieces.append(&mut label.pieces);
            label.pieces = pieces;
        } else if let Some(label) = spawn {
            label
                .borrow_mut()
                .pieces
                .insert(0, Rc::new(Piece::State(State::simple("TNT1", "A", 0))));
        }
    }

    fn header(&self) -> String {
        let mut header = self.name.clone();
        if let Some(inherit) = &self.inherit {
            let _ = write!(header, " : {inherit}");
        }
        if let Some(replace) = &self.replace {
            let _ = write!(header, " replaces {replace}");
        }
        if let Some(num) = self.editor_number {
            let _ = write!(header, " {num}");
        }
        header
    }

    /// Render the full class definition.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Actor {}", self.header());
        out.push_str("{\n");

        let mut properties = self.properties.clone();
        properties.sort_by(|a, b| a.name.cmp(&b.name));
        for p in &properties {
            let _ = writeln!(out, "    {} {}", p.name, p.value);
        }
        for u in &self.uservars {
            let size = match u.declared_size() {
                Some(n) if n > 0 => format!("[{n}]"),
                _ => String::new(),
            };
            let _ = writeln!(out, "    var {} {}{};", type_keyword(u.var_type), u.name, size);
        }
        for f in &self.flags {
            let _ = writeln!(out, "    +{f}");
        }
        for a in &self.antiflags {
            let _ = writeln!(out, "    -{a}");
        }
        for r in &self.raw {
            let _ = writeln!(out, "    {r}");
        }

        if !self.labels.is_empty() || !self.funcs.is_empty() {
            out.push_str("    States {\n");
            let mut lines = Vec::new();
            for func in &self.funcs {
                func.borrow().render_lines(&mut lines);
            }
            for label in &self.labels {
                let label = label.borrow();
                lines.push(format!("{}:", label.name));
                for piece in &label.pieces {
                    piece.render(&mut lines);
                }
            }
            for line in &lines {
                let indent = if line.ends_with(':') { 8 } else { 12 };
                let _ = writeln!(out, "{:indent$}{line}", "", indent = indent);
            }
            out.push_str("    }\n");
        }

        out.push('}');
        out
    }
}

/// The synthetic inventory-token actor backing one call marker.
pub struct MarkerActor {
    pub name: String,
}

impl MarkerActor {
    pub fn render(&self) -> String {
        format!("Actor {} : Inventory {{Inventory.MaxAmount 1}}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_includes_inherit_replace_and_number() {
        let mut actor = Actor::new("MyImp", Context::new());
        actor.inherit = Some("Imp".into());
        actor.replace = Some("Demon".into());
        actor.editor_number = Some(31000);
        assert_eq!(actor.header(), "MyImp : Imp replaces Demon 31000");
    }

    #[test]
    fn marker_actor_is_a_max_one_inventory() {
        let marker = MarkerActor {
            name: "StatecCall_U_0".into(),
        };
        assert_eq!(
            marker.render(),
            "Actor StatecCall_U_0 : Inventory {Inventory.MaxAmount 1}"
        );
    }

    #[test]
    fn spawn_is_synthesized_for_user_variables() {
        let mut actor = Actor::new("Counter", Context::new());
        actor.uservars.push(UserVar {
            name: "user_count".into(),
            var_type: UserVarType::Int,
            size: None,
            init: Some(UserVarInit::Value("10".into())),
        });
        actor.prepare_spawn();

        let text = actor.render();
        let spawn_at = text.find("Spawn:").expect("spawn label");
        let init_at = text
            .find("A_SetUserVar(\"user_count\", 10)")
            .expect("init state");
        assert!(init_at > spawn_at);
        assert!(text.contains("var int user_count;"));
        assert!(text.contains("stop"));
    }

    #[test]
    fn array_initialization_emits_one_state_per_element() {
        let mut actor = Actor::new("Table", Context::new());
        actor.uservars.push(UserVar {
            name: "user_speeds".into(),
            var_type: UserVarType::Float,
            size: None,
            init: Some(UserVarInit::Array(vec!["1.5".into(), "2.5".into()])),
        });
        actor.prepare_spawn();

        let text = actor.render();
        assert!(text.contains("var float user_speeds[2];"));
        assert!(text.contains("A_SetUserArrayFloat(\"user_speeds\", 0, 1.5)"));
        assert!(text.contains("A_SetUserArrayFloat(\"user_speeds\", 1, 2.5)"));
    }

    #[test]
    fn existing_spawn_keeps_user_code_after_the_prelude() {
        let mut actor = Actor::new("Guard", Context::new());
        actor.labels.push(Rc::new(RefCell::new(Label {
            name: "Spawn".into(),
            pieces: vec![Rc::new(Piece::State(State::simple("POSS", "A", 10)))],
        })));
        actor.uservars.push(UserVar {
            name: "user_mode".into(),
            var_type: UserVarType::Int,
            size: None,
            init: Some(UserVarInit::Value("1".into())),
        });
        actor.prepare_spawn();

        let text = actor.render();
        let init_at = text.find("A_SetUserVar(\"user_mode\", 1)").unwrap();
        let user_at = text.find("POSS A 10").unwrap();
        assert!(init_at < user_at);
    }

    #[test]
    fn spawn_without_user_variables_still_gets_the_leading_pad() {
        let mut actor = Actor::new("Guard", Context::new());
        actor.labels.push(Rc::new(RefCell::new(Label {
            name: "Spawn".into(),
            pieces: vec![Rc::new(Piece::State(State::simple("POSS", "A", 10)))],
        })));
        actor.prepare_spawn();

        let text = actor.render();
        let pad_at = text.find("TNT1 A 0").unwrap();
        let user_at = text.find("POSS A 10").unwrap();
        assert!(pad_at < user_at);
    }

    #[test]
    fn properties_render_sorted_by_name() {
        let mut actor = Actor::new("Sorted", Context::new());
        actor.properties.push(Property {
            name: "Speed".into(),
            value: "8".into(),
        });
        actor.properties.push(Property {
            name: "Health".into(),
            value: "100".into(),
        });
        let text = actor.render();
        assert!(text.find("Health 100").unwrap() < text.find("Speed 8").unwrap());
    }
}
