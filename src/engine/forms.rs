//! Combiner handlers and the ground form library.
use crate::arena::{lift_other, lift_to_return, Term, TermArena, TermChildren, TermId, Value};
use crate::engine::bind::{bind_parameter, bind_parameter_well_formed, extract_sigil};
use crate::engine::reduce::{
    reduce_children_ordered_async_unchecked, reduce_once, reduce_once_lifted, reduce_ordered,
    reduce_subsequent,
};
use crate::engine::types::{Context, ReductionStatus};
use crate::env::{EnvRef, Environment};
use crate::error::{EvalError, EvalResult};
use crate::parser::is_symbol;
use std::rc::Rc;

const IGNORE: &str = "#ignore";

/// A first-class combiner: anything installable in the head of a
/// branched list. The whole capability is one operation,
/// `invoke(term, ctx) -> status`.
#[derive(Clone)]
pub enum ContextHandler {
    /// Native procedure.
    Native(NativeForm),
    /// Wrapping handler forcing operand evaluation before the inner
    /// handler runs.
    Form(FormContextHandler),
    /// User-defined operative produced by `$vau`.
    Vau(Rc<VauHandler>),
}

impl ContextHandler {
    pub fn invoke(&self, term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
        match self {
            ContextHandler::Native(f) => (f.call)(term, ctx),
            ContextHandler::Form(f) => f.call_n(f.wrapping, term, ctx),
            ContextHandler::Vau(v) => v.invoke(term, ctx),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ContextHandler::Native(f) => format!("native {}", f.name),
            ContextHandler::Form(_) => "applicative".to_string(),
            ContextHandler::Vau(_) => "operative".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct NativeForm {
    pub name: &'static str,
    pub call: fn(TermId, &mut Context) -> EvalResult<ReductionStatus>,
}

/// Evaluates the operand list `wrapping` times before handing the term to
/// the underlying handler. `wrapping == 1` is the ordinary applicative
/// case.
#[derive(Clone)]
pub struct FormContextHandler {
    pub handler: Rc<ContextHandler>,
    pub wrapping: usize,
}

impl FormContextHandler {
    pub fn call_n(&self, n: usize, term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
        if n == 0 || ctx.arena.get(term).children.len() <= 1 {
            let next = ctx.next_term();
            return self.handler.invoke(next, ctx);
        }
        let this = self.clone();
        ctx.setup_front_guarded(move |c| {
            c.set_next_term(term);
            this.call_n(n - 1, term, c)
        });
        ctx.set_next_term(term);
        debug_assert!(ctx.arena.get(term).is_branch());
        let last = ctx.arena.get(term).children.len();
        reduce_children_ordered_async_unchecked(term, 1, last, ctx)?;
        Ok(ReductionStatus::Partial)
    }
}

/// Operative closure: formal tree, optional environment formal, body
/// sequence, and the static environment captured at construction.
pub struct VauHandler {
    formals: TermId,
    eformal: Option<String>,
    body: TermId,
    parent: EnvRef,
}

impl VauHandler {
    pub fn invoke(&self, term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
        let local = Environment::new_derived(self.parent.clone());
        if let Some(name) = &self.eformal {
            let dynamic = ctx.arena.add(Term::leaf(Value::Environment(ctx.record.clone())));
            local.borrow_mut().bind(name, dynamic);
        }
        ctx.arena.get_mut(term).children.remove(0);
        // Formals were validated when the operative was constructed.
        bind_parameter_well_formed(&mut ctx.arena, &local, self.formals, term)?;
        let body = ctx.arena.deep_copy(self.body);
        lift_other(&mut ctx.arena, term, body);
        ctx.record = local;
        reduce_ordered(term, ctx)
    }
}

/// Validate a formal tree ahead of binding, so calls can use the
/// unchecked matcher.
fn check_formal_tree(arena: &TermArena, t: TermId) -> EvalResult<()> {
    let term = arena.get(t);
    if term.is_list() {
        let n = term.children.len();
        for (k, &child) in term.children.iter().enumerate() {
            if k + 1 == n {
                if let Some(tok) = arena.get(child).value.token() {
                    if tok.starts_with('.') {
                        let mut rest = &tok[1..];
                        extract_sigil(&mut rest);
                        if rest.is_empty() || is_symbol(rest) {
                            continue;
                        }
                        return Err(EvalError::invalid_syntax(format!(
                            "Invalid rest parameter '{tok}' found."
                        )));
                    }
                }
            }
            check_formal_tree(arena, child)?;
        }
        Ok(())
    } else {
        match term.value.token() {
            Some(n) if n == IGNORE || is_symbol(n) => Ok(()),
            Some(n) => Err(EvalError::invalid_syntax(format!(
                "Invalid token '{n}' found for the formal parameter."
            ))),
            None => Err(EvalError::invalid_syntax(
                "Expected a symbol or a list for the formal parameter.",
            )),
        }
    }
}

fn syntax_error(message: &str) -> EvalError {
    EvalError::invalid_syntax(message.to_string())
}

fn form_sequence(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    ctx.arena.get_mut(term).children.remove(0);
    reduce_ordered(term, ctx)
}

fn truthy(arena: &TermArena, id: TermId) -> bool {
    let value = match &arena.get(id).value {
        Value::Reference(r) => &arena.get(r.referent()).value,
        other => other,
    };
    !matches!(value, Value::Bool(false))
}

fn form_if(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    ctx.arena.get_mut(term).children.remove(0);
    let n = ctx.arena.get(term).children.len();
    if !(2..=3).contains(&n) {
        return Err(syntax_error("Syntax error in conditional form."));
    }
    let test = ctx.arena.get(term).children[0];
    reduce_subsequent(test, ctx, move |c| {
        let pick = if truthy(&c.arena, test) {
            c.arena.get(term).children.get(1).copied()
        } else {
            c.arena.get(term).children.get(2).copied()
        };
        match pick {
            Some(branch) => reduce_once_lifted(term, c, branch),
            None => {
                let t = c.arena.get_mut(term);
                t.children.clear();
                t.value = Value::Unspecified;
                Ok(ReductionStatus::Regular)
            }
        }
    })
}

fn form_def(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    ctx.arena.get_mut(term).children.remove(0);
    if ctx.arena.get(term).children.len() < 2 {
        return Err(syntax_error("Syntax error in definition."));
    }
    let formals = ctx.arena.get_mut(term).children.remove(0);
    ctx.setup_front_guarded(move |c| {
        let env = c.record.clone();
        bind_parameter(&mut c.arena, &env, formals, term)?;
        let t = c.arena.get_mut(term);
        t.children.clear();
        t.value = Value::Unspecified;
        Ok(ReductionStatus::Regular)
    });
    reduce_ordered(term, ctx)
}

fn make_vau(
    term: TermId,
    ctx: &mut Context,
    wrapping: usize,
    has_eformal: bool,
) -> EvalResult<ReductionStatus> {
    ctx.arena.get_mut(term).children.remove(0);
    let min = if has_eformal { 2 } else { 1 };
    if ctx.arena.get(term).children.len() < min {
        return Err(syntax_error("Syntax error in function abstraction."));
    }
    let formals_src = ctx.arena.get(term).children[0];
    let formals = ctx.arena.deep_copy(formals_src);
    check_formal_tree(&ctx.arena, formals)?;
    let eformal = if has_eformal {
        let ef = ctx.arena.get(term).children[1];
        match ctx.arena.get(ef).value.token() {
            Some(s) if s == IGNORE => None,
            Some(s) if is_symbol(s) => Some(s.to_string()),
            _ => {
                return Err(syntax_error(
                    "Syntax error in the environment formal parameter.",
                ))
            }
        }
    } else {
        None
    };
    let body_src: TermChildren = ctx.arena.get(term).children[min..].iter().copied().collect();
    let mut body_children = TermChildren::with_capacity(body_src.len());
    for child in body_src {
        body_children.push(ctx.arena.deep_copy(child));
    }
    let body = ctx.arena.add(Term::list(body_children));
    let vau = Rc::new(VauHandler { formals, eformal, body, parent: ctx.record.clone() });
    let combiner = if wrapping == 0 {
        ContextHandler::Vau(vau)
    } else {
        ContextHandler::Form(FormContextHandler {
            handler: Rc::new(ContextHandler::Vau(vau)),
            wrapping,
        })
    };
    let t = ctx.arena.get_mut(term);
    t.children.clear();
    t.value = Value::Combiner(combiner);
    Ok(ReductionStatus::Regular)
}

fn form_vau(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    make_vau(term, ctx, 0, true)
}

fn form_lambda(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    make_vau(term, ctx, 1, false)
}

fn resolve_env_value(arena: &TermArena, id: TermId) -> Option<EnvRef> {
    let value = match &arena.get(id).value {
        Value::Reference(r) => &arena.get(r.referent()).value,
        other => other,
    };
    match value {
        Value::Environment(e) => Some(e.clone()),
        _ => None,
    }
}

fn eval_core(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    ctx.arena.get_mut(term).children.remove(0);
    if ctx.arena.get(term).children.len() != 2 {
        return Err(syntax_error("Syntax error in evaluation form."));
    }
    let target = ctx.arena.get(term).children[1];
    let env = resolve_env_value(&ctx.arena, target)
        .ok_or_else(|| syntax_error("Invalid environment operand for evaluation."))?;
    let expr = ctx.arena.get(term).children[0];
    lift_to_return(&mut ctx.arena, expr);
    lift_other(&mut ctx.arena, term, expr);
    ctx.record = env;
    reduce_once(term, ctx)
}

fn list_core(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    ctx.arena.get_mut(term).children.remove(0);
    Ok(ReductionStatus::Retained)
}

fn native(name: &'static str, call: fn(TermId, &mut Context) -> EvalResult<ReductionStatus>) -> ContextHandler {
    ContextHandler::Native(NativeForm { name, call })
}

fn applicative(
    name: &'static str,
    call: fn(TermId, &mut Context) -> EvalResult<ReductionStatus>,
) -> ContextHandler {
    ContextHandler::Form(FormContextHandler { handler: Rc::new(native(name, call)), wrapping: 1 })
}

/// Build the ground environment with the core form library installed.
pub fn ground_environment(arena: &mut TermArena) -> EnvRef {
    let env = Environment::new();
    let forms = [
        ("$sequence", native("$sequence", form_sequence)),
        ("$if", native("$if", form_if)),
        ("$def!", native("$def!", form_def)),
        ("$vau", native("$vau", form_vau)),
        ("$lambda", native("$lambda", form_lambda)),
        ("eval", applicative("eval", eval_core)),
        ("list", applicative("list", list_core)),
    ];
    for (name, handler) in forms {
        let term = arena.add(Term::leaf(Value::Combiner(handler)));
        env.borrow_mut().bind(name, term);
    }
    env
}
