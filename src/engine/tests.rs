use crate::arena::{Term, TermArena, TermId, Value};
use crate::engine::bind::bind_parameter;
use crate::engine::forms::{ground_environment, FormContextHandler, NativeForm, ContextHandler};
use crate::engine::reduce::{reduce_once, reduce_ordered};
use crate::engine::types::{Context, ReductionStatus};
use crate::engine::unparse::unparse;
use crate::env::{EnvRef, Environment};
use crate::error::{EvalError, EvalResult};
use crate::parser::parse_one;
use crate::tags::TermTags;
use num_bigint::BigInt;
use smallvec::smallvec;
use std::rc::Rc;

fn new_context() -> (Context, EnvRef) {
    let mut ctx = Context::new(Environment::new());
    let ground = ground_environment(&mut ctx.arena);
    let top = Environment::new_derived(ground);
    ctx.record = top.clone();
    (ctx, top)
}

fn eval_str(ctx: &mut Context, top: &EnvRef, src: &str) -> EvalResult<TermId> {
    let term = parse_one(&mut ctx.arena, src)?;
    ctx.record = top.clone();
    ctx.rewrite_term(term)?;
    Ok(term)
}

fn resolved<'a>(arena: &'a TermArena, id: TermId) -> &'a Value {
    match &arena.get(id).value {
        Value::Reference(r) => &arena.get(r.referent()).value,
        v => v,
    }
}

fn assert_int(arena: &TermArena, id: TermId, expected: i64) {
    match resolved(arena, id) {
        Value::Int(n) => assert_eq!(*n, BigInt::from(expected)),
        _ => panic!("expected integer {expected}, got {}", unparse(arena, id)),
    }
}

fn root_cause(e: &EvalError) -> &EvalError {
    match e {
        EvalError::InvalidSyntax { nested: Some(inner), .. } => root_cause(inner),
        other => other,
    }
}

#[test]
fn leaf_lookup_materializes_lvalue_reference() {
    let (mut ctx, top) = new_context();
    let bound = ctx.arena.add(Term::leaf(Value::Int(BigInt::from(42))));
    top.borrow_mut().bind("x", bound);

    let leaf = ctx.arena.add(Term::leaf(Value::Token("x".to_string())));
    let status = reduce_once(leaf, &mut ctx).expect("leaf reduction");
    assert_eq!(status, ReductionStatus::Neutral);
    match &ctx.arena.get(leaf).value {
        Value::Reference(r) => {
            assert_eq!(r.referent(), bound, "reference must alias the bound term");
            assert!(
                !r.tags().contains(TermTags::UNIQUE),
                "a materialized reference is never unique"
            );
            assert!(r.environment().is_alive());
        }
        _ => panic!("expected a materialized reference"),
    }

    // Idempotence: the second reduction retains the reference leaf.
    let again = reduce_once(leaf, &mut ctx).expect("second reduction");
    assert_eq!(again, ReductionStatus::Retained);
}

#[test]
fn leaf_lookup_collapses_reference_chains() {
    let (mut ctx, top) = new_context();
    let target = ctx.arena.add(Term::leaf(Value::Int(BigInt::from(9))));
    top.borrow_mut().bind("y", target);

    // Reduce y once, then bind the resulting reference term under z.
    let y_leaf = ctx.arena.add(Term::leaf(Value::Token("y".to_string())));
    reduce_once(y_leaf, &mut ctx).expect("reduce y");
    top.borrow_mut().bind("z", y_leaf);

    let z_leaf = ctx.arena.add(Term::leaf(Value::Token("z".to_string())));
    reduce_once(z_leaf, &mut ctx).expect("reduce z");
    match &ctx.arena.get(z_leaf).value {
        Value::Reference(r) => {
            assert_eq!(r.referent(), target, "chained references must collapse");
            assert!(!r.tags().contains(TermTags::UNIQUE));
        }
        _ => panic!("expected a collapsed reference"),
    }
}

#[test]
fn unbound_identifier_fails() {
    let (mut ctx, _top) = new_context();
    let leaf = ctx.arena.add(Term::leaf(Value::Token("nope".to_string())));
    match ctx.rewrite_term(leaf) {
        Err(EvalError::BadIdentifier(id)) => assert_eq!(id, "nope"),
        other => panic!("expected BadIdentifier, got {other:?}"),
    }
}

#[test]
fn singleton_collapse_reaches_inner_leaf() {
    let (mut ctx, _top) = new_context();
    // ((x)) with x unbound: the collapse walks to the leaf, then lookup
    // fails.
    let x = ctx.arena.add(Term::leaf(Value::Token("x".to_string())));
    let inner = ctx.arena.add(Term::list(smallvec![x]));
    let outer = ctx.arena.add(Term::list(smallvec![inner]));
    match ctx.rewrite_term(outer) {
        Err(EvalError::BadIdentifier(id)) => assert_eq!(id, "x"),
        other => panic!("expected BadIdentifier, got {other:?}"),
    }
}

#[test]
fn singleton_collapse_lifts_values() {
    let (mut ctx, top) = new_context();
    let term = eval_str(&mut ctx, &top, "(((((1)))))").expect("nested singleton");
    assert_int(&ctx.arena, term, 1);
}

#[test]
fn empty_head_is_elided_then_combiner_is_required() {
    let (mut ctx, _top) = new_context();
    let empty = ctx.arena.add(Term::empty_list());
    let one = ctx.arena.add(Term::leaf(Value::Int(BigInt::from(1))));
    let two = ctx.arena.add(Term::leaf(Value::Int(BigInt::from(2))));
    let term = ctx.arena.add(Term::list(smallvec![empty, one, two]));
    match ctx.rewrite_term(term) {
        Err(EvalError::ListReductionFailure(msg)) => {
            assert!(msg.contains("1 argument"), "arity in message: {msg}");
            assert!(msg.contains('1'), "operator in message: {msg}");
        }
        other => panic!("expected ListReductionFailure, got {other:?}"),
    }
    assert_eq!(ctx.pending(), 0, "errors must unwind pending continuations");
}

#[test]
fn literal_prefix_errors() {
    let (mut ctx, top) = new_context();
    for (src, needle) in [
        ("+12abc", "Unsupported literal prefix"),
        ("9lives", "Unsupported literal prefix"),
        ("#foo", "Invalid literal"),
    ] {
        let leaf = ctx.arena.add(Term::leaf(Value::Token(src.to_string())));
        ctx.record = top.clone();
        match ctx.rewrite_term(leaf) {
            Err(EvalError::InvalidSyntax { message, .. }) => {
                assert!(message.contains(needle), "{src}: {message}");
                assert!(message.contains(src), "{src}: {message}");
            }
            other => panic!("{src}: expected InvalidSyntax, got {other:?}"),
        }
    }
}

#[test]
fn sequence_value_is_last_expression() {
    let (mut ctx, top) = new_context();
    let term = eval_str(&mut ctx, &top, "($sequence 1 2 3)").expect("sequence");
    assert_int(&ctx.arena, term, 3);
}

#[test]
fn sequence_effects_are_ordered() {
    let (mut ctx, top) = new_context();
    let term = eval_str(&mut ctx, &top, "($sequence ($def! y 7) y)").expect("sequence");
    assert_int(&ctx.arena, term, 7);
}

#[test]
fn empty_sequence_is_unspecified() {
    let (mut ctx, top) = new_context();
    let term = eval_str(&mut ctx, &top, "($sequence)").expect("empty sequence");
    assert!(matches!(resolved(&ctx.arena, term), Value::Unspecified));
}

#[test]
fn applicative_evaluates_operands_in_order() {
    let (mut ctx, top) = new_context();
    eval_str(&mut ctx, &top, "($def! a 1)").expect("def a");
    let term = eval_str(&mut ctx, &top, "(list a 2 a)").expect("list call");
    let children = ctx.arena.get(term).children.clone();
    assert_eq!(children.len(), 3);
    assert_int(&ctx.arena, children[0], 1);
    assert_int(&ctx.arena, children[1], 2);
    assert_int(&ctx.arena, children[2], 1);
}

#[test]
fn call_n_forces_repeated_evaluation_passes() {
    let (mut ctx, top) = new_context();
    // A doubly wrapping handler: two full operand passes, then the native
    // list handler.
    let inner = ContextHandler::Native(NativeForm {
        name: "list",
        call: |term, ctx| {
            ctx.arena.get_mut(term).children.remove(0);
            Ok(ReductionStatus::Retained)
        },
    });
    let wrapped = ContextHandler::Form(FormContextHandler {
        handler: Rc::new(inner),
        wrapping: 2,
    });
    let holder = ctx.arena.add(Term::leaf(Value::Combiner(wrapped)));
    top.borrow_mut().bind("twice", holder);

    let term = eval_str(&mut ctx, &top, "(twice 4 5)").expect("double wrap");
    let children = ctx.arena.get(term).children.clone();
    assert_eq!(children.len(), 2);
    assert_int(&ctx.arena, children[0], 4);
    assert_int(&ctx.arena, children[1], 5);
}

#[test]
fn operative_receives_operands_unevaluated() {
    let (mut ctx, top) = new_context();
    eval_str(&mut ctx, &top, "($def! $quote ($vau (x) #ignore x))").expect("def quote");
    let term = eval_str(&mut ctx, &top, "($quote (unbound-op 1))").expect("quote");
    assert_eq!(unparse(&ctx.arena, term), "(unbound-op 1)");
}

#[test]
fn lambda_binds_and_reduces_body() {
    let (mut ctx, top) = new_context();
    let term = eval_str(&mut ctx, &top, "(($lambda (x) x) 5)").expect("lambda");
    assert_int(&ctx.arena, term, 5);
}

#[test]
fn vau_captures_dynamic_environment() {
    let (mut ctx, top) = new_context();
    eval_str(&mut ctx, &top, "($def! $env ($vau () e e))").expect("def env");
    eval_str(&mut ctx, &top, "($def! $quote ($vau (x) #ignore x))").expect("def quote");
    eval_str(&mut ctx, &top, "($def! z 5)").expect("def z");
    let term = eval_str(&mut ctx, &top, "(eval ($quote z) ($env))").expect("eval");
    assert_int(&ctx.arena, term, 5);
}

#[test]
fn conditional_form_selects_branch() {
    let (mut ctx, top) = new_context();
    let t = eval_str(&mut ctx, &top, "($if #t 1 2)").expect("if true");
    assert_int(&ctx.arena, t, 1);
    let f = eval_str(&mut ctx, &top, "($if #f 1 2)").expect("if false");
    assert_int(&ctx.arena, f, 2);
    let missing = eval_str(&mut ctx, &top, "($if #f 1)").expect("if without alternative");
    assert!(matches!(resolved(&ctx.arena, missing), Value::Unspecified));
}

#[test]
fn reduce_ordered_without_children_is_unspecified() {
    let (mut ctx, _top) = new_context();
    let term = ctx.arena.add(Term::empty_list());
    let status = reduce_ordered(term, &mut ctx).expect("ordered");
    assert_eq!(status, ReductionStatus::Retained);
    assert!(matches!(ctx.arena.get(term).value, Value::Unspecified));
}

#[test]
fn definition_binds_structured_formals() {
    let (mut ctx, top) = new_context();
    eval_str(&mut ctx, &top, "($def! (a b) (list 10 20))").expect("structured def");
    let a = eval_str(&mut ctx, &top, "a").expect("a");
    assert_int(&ctx.arena, a, 10);
    let b = eval_str(&mut ctx, &top, "b").expect("b");
    assert_int(&ctx.arena, b, 20);
}

#[test]
fn matcher_stack_is_flat_in_formal_depth() {
    let (mut ctx, top) = new_context();
    // Deep enough that direct recursion would exhaust the host stack.
    let depth = 50_000;
    let mut formal = ctx.arena.add(Term::leaf(Value::Token("deep".to_string())));
    let mut operand = ctx.arena.add(Term::leaf(Value::Int(BigInt::from(1))));
    for _ in 0..depth {
        formal = ctx.arena.add(Term::list(smallvec![formal]));
        operand = ctx.arena.add(Term::list(smallvec![operand]));
    }
    bind_parameter(&mut ctx.arena, &top, formal, operand).expect("deep match");
    let bound = top.borrow().lookup_local("deep").expect("deep bound");
    assert_int(&ctx.arena, bound, 1);
}

#[test]
fn rewrite_honors_step_limit() {
    let (mut ctx, top) = new_context();
    ctx.step_limit = 1;
    let term = parse_one(&mut ctx.arena, "(list 1 2 3)").expect("parse");
    ctx.record = top;
    ctx.rewrite_term(term).expect("limited rewrite");
    assert!(ctx.step_limit_hit, "step limit must be reported");
    assert_eq!(ctx.pending(), 0, "hitting the limit unwinds the queue");
}

#[test]
fn traversal_errors_are_wrapped_for_checked_binding() {
    let (mut ctx, top) = new_context();
    let formal = parse_one(&mut ctx.arena, "(a b)").expect("formal");
    let operand = parse_one(&mut ctx.arena, "(1 2 3 4)").expect("operand");
    let err = bind_parameter(&mut ctx.arena, &top, formal, operand).unwrap_err();
    assert!(matches!(err, EvalError::InvalidSyntax { .. }), "wrapped: {err:?}");
    match root_cause(&err) {
        EvalError::ArityMismatch { expected, actual } => {
            assert_eq!((*expected, *actual), (2, 4));
        }
        other => panic!("expected nested ArityMismatch, got {other:?}"),
    }
}
