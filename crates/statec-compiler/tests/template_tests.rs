//! Template engine tests: memoization, abstract members, generated names,
//! output groups and derivation-driven classes.

use statec_compiler::{Compiler, ErrorKind};
use statec_types::ast::*;

fn module(declarations: Vec<Declaration>) -> Module {
    Module { declarations }
}

fn compile_unit(module: &Module) -> String {
    let mut compiler = Compiler::with_unit_id("UNIT");
    compiler
        .add_module(module)
        .expect("compilation should succeed");
    compiler.assemble()
}

fn compile_err(module: &Module) -> statec_compiler::CompileError {
    let mut compiler = Compiler::with_unit_id("UNIT");
    compiler
        .add_module(module)
        .expect_err("compilation should fail")
}

fn frame() -> Stmt {
    Stmt::Frames(FramesStmt::simple("PUFF", "A", 2))
}

/// A plain template: one parameter feeding a property.
fn bullet_template() -> Declaration {
    Declaration::Template(TemplateDecl {
        name: "Bullet".into(),
        parameters: vec!["SPEED".into()],
        inherit: None,
        replace: None,
        editor_number: None,
        group: None,
        body: vec![ClassItem::Property {
            name: "Speed".into(),
            values: vec![Parameter::expr(Expr::var("SPEED"))],
        }],
    })
}

fn derivation(template: &str, parameters: Vec<Parameter>, body: Vec<ClassItem>) -> TemplateDerivation {
    TemplateDerivation {
        template: template.into(),
        parameters,
        body,
    }
}

fn property_of(deriv: TemplateDerivation) -> ClassItem {
    ClassItem::Property {
        name: "DropItem".into(),
        values: vec![Parameter::Derivation(deriv)],
    }
}

#[test]
fn identical_parameters_reuse_one_generated_class() {
    let m = module(vec![
        bullet_template(),
        Declaration::Class(ClassDecl {
            name: "Pistol".into(),
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![
                property_of(derivation(
                    "Bullet",
                    vec![Parameter::expr(Expr::number(10.0))],
                    vec![],
                )),
                ClassItem::Property {
                    name: "MissileName".into(),
                    values: vec![Parameter::Derivation(derivation(
                        "Bullet",
                        vec![Parameter::expr(Expr::number(10.0))],
                        vec![],
                    ))],
                },
            ],
        }),
    ]);
    let out = compile_unit(&m);

    // One generated actor serves both call sites.
    assert_eq!(out.matches("Actor Bullet__deriv_").count(), 1);
    assert!(out.contains("Speed 10"), "{out}");

    // Both properties carry the same quoted class name.
    let name = out
        .lines()
        .find_map(|l| {
            l.trim()
                .strip_prefix("Actor ")
                .and_then(|rest| rest.split_whitespace().next())
                .filter(|n| n.starts_with("Bullet__deriv_"))
        })
        .expect("generated actor header");
    assert_eq!(out.matches(&format!("\"{name}\"")).count(), 2);
}

#[test]
fn distinct_parameters_generate_distinct_classes() {
    let m = module(vec![
        bullet_template(),
        Declaration::Class(ClassDecl {
            name: "Pistol".into(),
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![
                property_of(derivation(
                    "Bullet",
                    vec![Parameter::expr(Expr::number(10.0))],
                    vec![],
                )),
                ClassItem::Property {
                    name: "MissileName".into(),
                    values: vec![Parameter::Derivation(derivation(
                        "Bullet",
                        vec![Parameter::expr(Expr::number(20.0))],
                        vec![],
                    ))],
                },
            ],
        }),
    ]);
    let out = compile_unit(&m);

    assert_eq!(out.matches("Actor Bullet__deriv_").count(), 2);
    assert!(out.contains("Speed 10"), "{out}");
    assert!(out.contains("Speed 20"), "{out}");
}

#[test]
fn abstract_templates_never_share_classes_across_call_sites() {
    let turret = Declaration::Template(TemplateDecl {
        name: "Turret".into(),
        parameters: vec![],
        inherit: None,
        replace: None,
        editor_number: None,
        group: None,
        body: vec![ClassItem::AbstractLabel("Fire".into())],
    });
    let fire_override = || ClassItem::Label {
        name: "Fire".into(),
        body: vec![frame()],
    };
    let m = module(vec![
        turret,
        Declaration::Class(ClassDecl {
            name: "Fort".into(),
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![
                property_of(derivation("Turret", vec![], vec![fire_override()])),
                ClassItem::Property {
                    name: "MissileName".into(),
                    values: vec![Parameter::Derivation(derivation(
                        "Turret",
                        vec![],
                        vec![fire_override()],
                    ))],
                },
            ],
        }),
    ]);
    let out = compile_unit(&m);

    // Identical parameters and overrides, still two distinct classes.
    assert_eq!(out.matches("Actor Turret__deriv_").count(), 2);
}

#[test]
fn missing_abstract_label_is_reported_by_name() {
    let m = module(vec![
        Declaration::Template(TemplateDecl {
            name: "Turret".into(),
            parameters: vec![],
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![ClassItem::AbstractLabel("Fire".into())],
        }),
        Declaration::StaticDerivation(StaticDerivation {
            name: "BareTurret".into(),
            group: None,
            source: derivation("Turret", vec![], vec![]),
        }),
    ]);
    let err = compile_err(&m);
    assert_eq!(
        err.kind,
        ErrorKind::MissingAbstractLabel {
            template: "Turret".into(),
            name: "FIRE".into(),
        }
    );
}

#[test]
fn abstract_macro_arity_mismatch_is_reported() {
    let m = module(vec![
        Declaration::Template(TemplateDecl {
            name: "Caster".into(),
            parameters: vec![],
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![ClassItem::AbstractMacro {
                name: "cast".into(),
                args: vec!["SPELL".into(), "POWER".into()],
            }],
        }),
        Declaration::StaticDerivation(StaticDerivation {
            name: "FireCaster".into(),
            group: None,
            source: derivation(
                "Caster",
                vec![],
                vec![ClassItem::Macro(MacroDef {
                    name: "cast".into(),
                    args: vec!["SPELL".into()],
                    body: vec![frame()],
                })],
            ),
        }),
    ]);
    let err = compile_err(&m);
    assert_eq!(
        err.kind,
        ErrorKind::AbstractMacroArity {
            template: "Caster".into(),
            name: "CAST".into(),
            expected: 2,
            got: 1,
        }
    );
}

#[test]
fn abstract_array_size_constraint_is_enforced() {
    let template = |name: &str, size: ArraySize| {
        Declaration::Template(TemplateDecl {
            name: name.into(),
            parameters: vec![],
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![ClassItem::AbstractArray {
                name: "angles".into(),
                spec: AbstractArraySpec {
                    size,
                    var_type: UserVarType::Int,
                },
            }],
        })
    };
    let array_override = |n: usize| ClassItem::Array {
        name: "angles".into(),
        values: (0..n).map(|i| Expr::number(i as f64)).collect(),
    };

    let bad = module(vec![
        template("Fan", ArraySize::Fixed(3)),
        Declaration::StaticDerivation(StaticDerivation {
            name: "NarrowFan".into(),
            group: None,
            source: derivation("Fan", vec![], vec![array_override(2)]),
        }),
    ]);
    let err = compile_err(&bad);
    assert_eq!(
        err.kind,
        ErrorKind::AbstractArraySize {
            template: "Fan".into(),
            name: "ANGLES".into(),
            expected: 3,
            got: 2,
        }
    );

    // `any`-sized abstract arrays take whatever they are given, and the
    // override lands as an initialized user array.
    let good = module(vec![
        template("WideFan", ArraySize::Any),
        Declaration::StaticDerivation(StaticDerivation {
            name: "AnyFan".into(),
            group: None,
            source: derivation("WideFan", vec![], vec![array_override(2)]),
        }),
    ]);
    let out = compile_unit(&good);
    assert!(out.contains("Actor AnyFan"), "{out}");
    assert!(out.contains("var int angles[2];"), "{out}");
    assert!(out.contains("A_SetUserArray(\"angles\", 0, 0)"), "{out}");
    assert!(out.contains("A_SetUserArray(\"angles\", 1, 1)"), "{out}");
}

#[test]
fn template_parameter_arity_is_checked() {
    let m = module(vec![
        bullet_template(),
        Declaration::StaticDerivation(StaticDerivation {
            name: "OddBullet".into(),
            group: None,
            source: derivation(
                "Bullet",
                vec![
                    Parameter::expr(Expr::number(1.0)),
                    Parameter::expr(Expr::number(2.0)),
                ],
                vec![],
            ),
        }),
    ]);
    let err = compile_err(&m);
    assert_eq!(
        err.kind,
        ErrorKind::TemplateArity {
            template: "Bullet".into(),
            expected: 1,
            got: 2,
        }
    );
}

#[test]
fn unknown_template_is_reported_with_scope() {
    let m = module(vec![Declaration::StaticDerivation(StaticDerivation {
        name: "Ghost".into(),
        group: None,
        source: derivation("Phantom", vec![], vec![]),
    })]);
    let err = compile_err(&m);
    assert_eq!(err.kind, ErrorKind::UnknownTemplate("Phantom".into()));
    assert!(
        err.scope
            .to_string()
            .contains("static template derivation 'Ghost'"),
        "{err}"
    );
}

#[test]
fn static_derivations_produce_named_classes() {
    let m = module(vec![
        bullet_template(),
        Declaration::StaticDerivation(StaticDerivation {
            name: "FastBullet".into(),
            group: None,
            source: derivation("Bullet", vec![Parameter::expr(Expr::number(40.0))], vec![]),
        }),
    ]);
    let out = compile_unit(&m);

    assert!(out.contains("Actor FastBullet"), "{out}");
    assert!(out.contains("Speed 40"), "{out}");
}

#[test]
fn self_replacement_names_the_derived_class() {
    let m = module(vec![
        Declaration::Template(TemplateDecl {
            name: "Echo".into(),
            parameters: vec![],
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![ClassItem::Label {
                name: "Ready".into(),
                body: vec![Stmt::Frames(
                    FramesStmt::simple("TNT1", "A", 0).with_action(ActionCall::with_args(
                        "A_SpawnItem",
                        vec![Parameter::expr(Expr::var("SELF"))],
                    )),
                )],
            }],
        }),
        Declaration::StaticDerivation(StaticDerivation {
            name: "EchoOne".into(),
            group: None,
            source: derivation("Echo", vec![], vec![]),
        }),
    ]);
    let out = compile_unit(&m);
    assert!(out.contains("A_SpawnItem(\"EchoOne\")"), "{out}");
}

#[test]
fn template_output_groups_collect_derived_classes() {
    let m = module(vec![
        Declaration::Group(GroupDecl {
            name: "guns".into(),
            members: vec![],
        }),
        Declaration::Template(TemplateDecl {
            name: "Gun".into(),
            parameters: vec!["DAMAGE".into()],
            inherit: None,
            replace: None,
            editor_number: None,
            group: Some("guns".into()),
            body: vec![],
        }),
        Declaration::StaticDerivation(StaticDerivation {
            name: "Rifle".into(),
            group: None,
            source: derivation("Gun", vec![Parameter::expr(Expr::number(8.0))], vec![]),
        }),
        Declaration::StaticDerivation(StaticDerivation {
            name: "Shotgun".into(),
            group: None,
            source: derivation("Gun", vec![Parameter::expr(Expr::number(16.0))], vec![]),
        }),
        Declaration::Class(ClassDecl {
            name: "Rack".into(),
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![ClassItem::Label {
                name: "Ready".into(),
                body: vec![Stmt::For {
                    item: "g".into(),
                    index: None,
                    group: "guns".into(),
                    body: vec![Stmt::Frames(
                        FramesStmt::simple("TNT1", "A", 0).with_action(ActionCall::with_args(
                            "A_SpawnItem",
                            vec![Parameter::expr(Expr::var("g"))],
                        )),
                    )],
                    else_body: None,
                }],
            }],
        }),
    ]);
    let out = compile_unit(&m);

    assert!(out.contains("A_SpawnItem(\"Rifle\")"), "{out}");
    assert!(out.contains("A_SpawnItem(\"Shotgun\")"), "{out}");
}

#[test]
fn derivation_overrides_fill_abstract_labels() {
    let m = module(vec![
        Declaration::Template(TemplateDecl {
            name: "Turret".into(),
            parameters: vec!["SPRITE".into()],
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![
                ClassItem::AbstractLabel("Fire".into()),
                ClassItem::Label {
                    name: "Ready".into(),
                    body: vec![Stmt::Frames(FramesStmt {
                        sprite: SpriteRef::Parametrised("SPRITE".into()),
                        frames: vec!["A".into()],
                        duration: 6,
                        modifiers: vec![],
                        action: None,
                    })],
                },
            ],
        }),
        Declaration::StaticDerivation(StaticDerivation {
            name: "PlasmaTurret".into(),
            group: None,
            source: derivation(
                "Turret",
                vec![Parameter::expr(Expr::text("PLSS"))],
                vec![ClassItem::Label {
                    name: "Fire".into(),
                    body: vec![frame()],
                }],
            ),
        }),
    ]);
    let out = compile_unit(&m);

    assert!(out.contains("Actor PlasmaTurret"), "{out}");
    // The override label and the template's own label both render, with
    // the parametrised sprite resolved through the parameter binding.
    assert!(out.contains("Fire:"), "{out}");
    assert!(out.contains("PLSS A 6"), "{out}");
    assert!(out.contains("PUFF A 2"), "{out}");
}

#[test]
fn parametrised_sprites_must_be_quoted_strings() {
    let m = module(vec![
        Declaration::Template(TemplateDecl {
            name: "Blinker".into(),
            parameters: vec!["SPRITE".into()],
            inherit: None,
            replace: None,
            editor_number: None,
            group: None,
            body: vec![ClassItem::Label {
                name: "Ready".into(),
                body: vec![Stmt::Frames(FramesStmt {
                    sprite: SpriteRef::Parametrised("SPRITE".into()),
                    frames: vec!["A".into()],
                    duration: 1,
                    modifiers: vec![],
                    action: None,
                })],
            }],
        }),
        Declaration::StaticDerivation(StaticDerivation {
            name: "BadBlinker".into(),
            group: None,
            source: derivation("Blinker", vec![Parameter::expr(Expr::number(5.0))], vec![]),
        }),
    ]);
    let err = compile_err(&m);
    assert_eq!(
        err.kind,
        ErrorKind::SpriteParameterNotString {
            name: "SPRITE".into(),
            got: "5".into(),
        }
    );
}
