use vau::arena::{TermArena, TermId, Value};
use vau::engine::forms::ground_environment;
use vau::engine::types::Context;
use vau::engine::unparse::unparse;
use vau::env::{EnvRef, Environment};
use vau::error::{EvalError, EvalResult};
use vau::parser::Parser;
use num_bigint::BigInt;

struct Session {
    ctx: Context,
    top: EnvRef,
}

impl Session {
    fn new() -> Self {
        let mut ctx = Context::new(Environment::new());
        let ground = ground_environment(&mut ctx.arena);
        let top = Environment::new_derived(ground);
        ctx.record = top.clone();
        Session { ctx, top }
    }

    fn eval(&mut self, src: &str) -> EvalResult<TermId> {
        let mut parser = Parser::new(src);
        let mut last = None;
        while parser.has_more() {
            let term = parser.parse_term(&mut self.ctx.arena)?;
            self.ctx.record = self.top.clone();
            self.ctx.rewrite_term(term)?;
            last = Some(term);
        }
        last.ok_or_else(|| EvalError::invalid_syntax("Empty program."))
    }

    fn eval_rendered(&mut self, src: &str) -> String {
        let term = self.eval(src).expect("evaluation");
        unparse(&self.ctx.arena, term)
    }
}

fn resolved<'a>(arena: &'a TermArena, id: TermId) -> &'a Value {
    match &arena.get(id).value {
        Value::Reference(r) => &arena.get(r.referent()).value,
        v => v,
    }
}

fn assert_int(session: &Session, id: TermId, expected: i64) {
    match resolved(&session.ctx.arena, id) {
        Value::Int(n) => assert_eq!(*n, BigInt::from(expected)),
        _ => panic!("expected {expected}, got {}", unparse(&session.ctx.arena, id)),
    }
}

#[test]
fn literals_are_self_evaluating() {
    let mut s = Session::new();
    assert_eq!(s.eval_rendered("42"), "42");
    assert_eq!(s.eval_rendered("#t"), "#t");
    assert_eq!(s.eval_rendered("#f"), "#f");
    assert_eq!(s.eval_rendered("\"hi\""), "\"hi\"");
    assert_eq!(s.eval_rendered("()"), "()");
}

#[test]
fn definition_then_lookup() {
    let mut s = Session::new();
    let term = s.eval("($def! x 42) x").expect("def then lookup");
    assert_int(&s, term, 42);
}

#[test]
fn list_builds_evaluated_operands() {
    let mut s = Session::new();
    assert_eq!(s.eval_rendered("($def! a 1) (list a 2 (list a))"), "(1 2 (1))");
}

#[test]
fn lambda_rest_parameters() {
    let mut s = Session::new();
    assert_eq!(s.eval_rendered("(($lambda (x .y) y) 1 2 3)"), "(2 3)");
}

#[test]
fn lambda_ignores_ignored_formals() {
    let mut s = Session::new();
    let term = s.eval("(($lambda (#ignore) 9) 1)").expect("ignored formal");
    assert_int(&s, term, 9);
}

#[test]
fn lambda_closes_over_static_environment() {
    let mut s = Session::new();
    let term = s
        .eval("($def! k (($lambda (n) ($lambda () n)) 6)) (k)")
        .expect("closure");
    assert_int(&s, term, 6);
}

#[test]
fn inner_bindings_shadow_outer() {
    let mut s = Session::new();
    let term = s
        .eval("($def! n 1) ($def! f ($lambda (n) n)) (f 2)")
        .expect("shadowing");
    assert_int(&s, term, 2);
    let outer = s.eval("n").expect("outer n");
    assert_int(&s, outer, 1);
}

#[test]
fn operatives_see_operands_as_written() {
    let mut s = Session::new();
    s.eval("($def! $quote ($vau (x) #ignore x))").expect("def quote");
    assert_eq!(s.eval_rendered("($quote (no such thing))"), "(no such thing)");
}

#[test]
fn eval_reduces_in_the_given_environment() {
    let mut s = Session::new();
    let term = s
        .eval(
            "($def! $quote ($vau (x) #ignore x))
             ($def! $here ($vau () e e))
             ($def! q 3)
             (eval ($quote q) ($here))",
        )
        .expect("eval in env");
    assert_int(&s, term, 3);
}

#[test]
fn sequence_returns_last_and_orders_effects() {
    let mut s = Session::new();
    let term = s
        .eval("($sequence ($def! v 1) ($def! w 2) (list v w))")
        .expect("sequence");
    assert_eq!(unparse(&s.ctx.arena, term), "(1 2)");
}

#[test]
fn conditionals_pick_by_boolean() {
    let mut s = Session::new();
    let term = s
        .eval("($def! pick ($lambda (c) ($if c 1 2))) (pick #f)")
        .expect("conditional");
    assert_int(&s, term, 2);
}

#[test]
fn unknown_identifier_is_reported() {
    let mut s = Session::new();
    match s.eval("(definitely-unbound)") {
        Err(EvalError::BadIdentifier(id)) => assert_eq!(id, "definitely-unbound"),
        other => panic!("expected BadIdentifier, got {other:?}"),
    }
}

#[test]
fn applying_a_noncombiner_is_reported() {
    let mut s = Session::new();
    match s.eval("((list 1) 2)") {
        Err(EvalError::ListReductionFailure(msg)) => {
            assert!(msg.contains("(1)"), "operator named in message: {msg}");
        }
        other => panic!("expected ListReductionFailure, got {other:?}"),
    }
    assert_eq!(s.ctx.pending(), 0, "failed rewrites leave no queued work");
}

#[test]
fn malformed_literals_are_reported() {
    let mut s = Session::new();
    match s.eval("#foo") {
        Err(EvalError::InvalidSyntax { message, .. }) => {
            assert!(message.contains("Invalid literal"), "{message}");
        }
        other => panic!("expected InvalidSyntax, got {other:?}"),
    }
    match s.eval("(list +12abc)") {
        Err(EvalError::InvalidSyntax { message, .. }) => {
            assert!(message.contains("Unsupported literal prefix"), "{message}");
        }
        other => panic!("expected InvalidSyntax, got {other:?}"),
    }
}

#[test]
fn vau_validates_formal_trees_at_construction() {
    let mut s = Session::new();
    match s.eval("($vau (a 5) #ignore a)") {
        Err(EvalError::InvalidSyntax { .. }) => {}
        other => panic!("expected InvalidSyntax, got {other:?}"),
    }
}

#[test]
fn deeply_nested_singletons_collapse() {
    let mut s = Session::new();
    let mut src = String::new();
    let depth = 200;
    for _ in 0..depth {
        src.push('(');
    }
    src.push_str("42");
    for _ in 0..depth {
        src.push(')');
    }
    let term = s.eval(&src).expect("singleton tower");
    assert_int(&s, term, 42);
}

#[test]
fn comments_and_whitespace_are_skipped() {
    let mut s = Session::new();
    let term = s
        .eval("; leading comment\n($def! x 5) ; trailing\nx")
        .expect("comments");
    assert_int(&s, term, 5);
}
