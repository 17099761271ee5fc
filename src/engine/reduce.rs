use crate::arena::{lift_other, TermId, TermReference, Value};
use crate::engine::forms::ContextHandler;
use crate::engine::types::{check_reducible, Context, ReductionStatus};
use crate::engine::unparse::{debug_unparse, term_kind, term_to_string_with_reference_mark};
use crate::env::{EnvWeak, Environment};
use crate::error::{EvalError, EvalResult};
use crate::tags::TermTags;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

pub static EVAL_DEBUG_LEVEL_OVERRIDE: AtomicU64 = AtomicU64::new(u64::MAX);

fn eval_debug_level() -> u64 {
    static LEVEL: OnceLock<u64> = OnceLock::new();
    let override_level = EVAL_DEBUG_LEVEL_OVERRIDE.load(Ordering::Relaxed);
    if override_level != u64::MAX {
        return override_level;
    }
    *LEVEL.get_or_init(|| {
        std::env::var("VAU_EVAL_DEBUG")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    })
}

pub fn set_eval_debug_level_override(level: Option<u64>) {
    let val = level.unwrap_or(u64::MAX);
    EVAL_DEBUG_LEVEL_OVERRIDE.store(val, Ordering::Relaxed);
}

pub(crate) fn eval_debug(level: u64) -> bool {
    eval_debug_level() >= level
}

/// Strip `Unique` so a stored reference always presents an lvalue view.
pub fn ensure_lvalue_reference(reference: TermReference) -> TermReference {
    reference.with_tags(reference.tags().lvalue())
}

/// Dispatch one reduction of `term` through the context's pluggable
/// dispatcher.
pub fn reduce_once(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    ctx.set_next_term(term);
    (ctx.reduce_once)(term, ctx)
}

/// Default dispatch: populated value slot means leaf, otherwise branch.
pub fn default_reduce_once(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    if ctx.arena.get(term).value.is_none() {
        reduce_branch(term, ctx)
    } else {
        reduce_leaf(term, ctx)
    }
}

/// Lift `src` into `term`'s place, then reduce the result once.
pub fn reduce_once_lifted(term: TermId, ctx: &mut Context, src: TermId) -> EvalResult<ReductionStatus> {
    lift_other(&mut ctx.arena, term, src);
    reduce_once(term, ctx)
}

/// Identifier lookup and reference materialization.
///
/// Leaves that are not tokens (numbers, booleans, references already
/// materialized) are retained unchanged.
pub fn reduce_leaf(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    let id = match ctx.arena.get(term).value.token() {
        Some(s) => s.to_string(),
        None => return Ok(ReductionStatus::Retained),
    };
    if id.is_empty() {
        return Ok(ReductionStatus::Retained);
    }
    let leader = id.as_bytes()[0] as char;
    if (id.len() > 1
        && matches!(leader, '#' | '+' | '-')
        && id.chars().any(|c| c != '+' && c != '-'))
        || leader.is_ascii_digit()
    {
        return Err(if leader == '#' {
            EvalError::invalid_syntax(format!("Invalid literal '{id}' found."))
        } else {
            EvalError::invalid_syntax(format!(
                "Unsupported literal prefix found in literal '{id}'."
            ))
        });
    }
    match Environment::resolve(&ctx.record, &id) {
        Some((bound, owner)) => {
            let bound_reference = match &ctx.arena.get(bound).value {
                Value::Reference(r) => Some(r.clone()),
                _ => None,
            };
            if let Some(r) = bound_reference {
                // Collapse the chain: take a shallow view of the bound
                // term under the lvalue invariant.
                let children = ctx.arena.get(bound).children.clone();
                let t = ctx.arena.get_mut(term);
                t.children = children;
                t.value = Value::Reference(ensure_lvalue_reference(r));
            } else {
                let tags = owner.borrow().make_term_tags() & !TermTags::UNIQUE;
                ctx.arena.get_mut(term).value = Value::Reference(TermReference::new(
                    tags,
                    bound,
                    EnvWeak::new(&owner),
                ));
            }
            let res = ReductionStatus::Neutral;
            if check_reducible(res) {
                reduce_once(term, ctx)
            } else {
                Ok(res)
            }
        }
        None => Err(EvalError::BadIdentifier(id)),
    }
}

/// List normalization and combined-branch scheduling.
pub fn reduce_branch(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    if !ctx.arena.get(term).is_branch() {
        return Ok(ReductionStatus::Retained);
    }
    if ctx.arena.get(term).children.len() == 1 {
        // Walk the left spine of singletons so recursive subterms cannot
        // grow the scheduler without bound.
        let mut inner = ctx.arena.get(term).children[0];
        while ctx.arena.get(inner).children.len() == 1 {
            inner = ctx.arena.get(inner).children[0];
        }
        return reduce_once_lifted(term, ctx, inner);
    }
    let head = ctx.arena.get(term).children[0];
    if ctx.arena.get(head).is_empty_list() {
        // Empty head is a no-op operator position.
        ctx.arena.get_mut(term).children.remove(0);
    }
    debug_assert!(ctx.arena.get(term).is_branched_list());
    if eval_debug(2) {
        eprintln!(
            "REDUCE_BRANCH term={} head_kind={} form={}",
            term.0,
            term_kind(&ctx.arena, ctx.arena.get(term).children[0]),
            debug_unparse(&ctx.arena, term)
        );
    }
    ctx.set_next_term(term);
    ctx.last_status = ReductionStatus::Neutral;
    let sub = ctx.arena.get(term).children[0];
    ctx.setup_front_guarded(move |c| {
        c.set_next_term(term);
        reduce_combined_branch(term, c)
    });
    ctx.setup_front(move |c| reduce_once(sub, c));
    Ok(ReductionStatus::Partial)
}

/// Operator resolution for a branched list whose head has been reduced.
pub fn reduce_combined_branch(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    debug_assert!(ctx.arena.get(term).is_branched_list());
    let fm = ctx.arena.get(term).children[0];
    let head_reference = match &ctx.arena.get(fm).value {
        Value::Reference(r) => Some(r.clone()),
        _ => None,
    };
    if let Some(r) = head_reference {
        // A reference head means the whole call is not a temporary
        // expression.
        let tags = ctx.arena.get(term).tags;
        ctx.arena.get_mut(term).tags = tags & !TermTags::TEMPORARY;
        let handler = match &ctx.arena.get(r.referent()).value {
            Value::Combiner(h) => Some(h.clone()),
            _ => None,
        };
        if let Some(h) = handler {
            return combiner_return_thunk(term, ctx, h, None);
        }
    } else {
        let tags = ctx.arena.get(term).tags;
        ctx.arena.get_mut(term).tags = tags | TermTags::TEMPORARY;
        if let Value::Combiner(_) = ctx.arena.get(fm).value {
            let taken = std::mem::replace(&mut ctx.arena.get_mut(fm).value, Value::None);
            if let Value::Combiner(h) = taken {
                return combiner_return_thunk(term, ctx, h.clone(), Some(h));
            }
        }
    }
    let (nd, has_ref) = match &ctx.arena.get(fm).value {
        Value::Reference(r) => (r.referent(), true),
        _ => (fm, false),
    };
    let rendered = term_to_string_with_reference_mark(&ctx.arena, nd, has_ref);
    let arity = ctx.arena.get(term).children.len() - 1;
    Err(EvalError::ListReductionFailure(format!(
        "No matching combiner '{rendered}' for operand with {arity} argument(s) found."
    )))
}

/// Enter a combiner through the tail-call action: clear the call term's
/// value slot, retain the handler if it was passed by value, and relay to
/// a continuation that invokes it on the next term.
fn combiner_return_thunk(
    term: TermId,
    ctx: &mut Context,
    handler: ContextHandler,
    owned: Option<ContextHandler>,
) -> EvalResult<ReductionStatus> {
    {
        let act = ctx.ensure_tco_action(term);
        act.last_function = None;
        if let Some(own) = owned {
            let attached = act.attach_function(own);
            act.last_function = Some(attached);
        }
    }
    ctx.arena.get_mut(term).value = Value::None;
    ctx.set_next_term(term);
    let f = match ctx.tco_last_function() {
        Some(last) => last,
        None => handler,
    };
    ctx.relay_switched(move |c| {
        let t = c.next_term();
        f.invoke(t, c)
    })
}

/// Reduce `term`, then continue with `next` once it is done. The
/// continuation resumes in the scheduling environment.
pub fn reduce_subsequent<F>(term: TermId, ctx: &mut Context, next: F) -> EvalResult<ReductionStatus>
where
    F: FnOnce(&mut Context) -> EvalResult<ReductionStatus> + 'static,
{
    ctx.setup_front_guarded(next);
    reduce_once(term, ctx)
}

/// Reduce the children of `term` in `first..last`, left to right.
pub fn reduce_children_ordered_async(
    term: TermId,
    first: usize,
    last: usize,
    ctx: &mut Context,
) -> EvalResult<ReductionStatus> {
    if first != last {
        reduce_children_ordered_async_unchecked(term, first, last, ctx)
    } else {
        Ok(ReductionStatus::Neutral)
    }
}

pub fn reduce_children_ordered_async_unchecked(
    term: TermId,
    first: usize,
    last: usize,
    ctx: &mut Context,
) -> EvalResult<ReductionStatus> {
    debug_assert!(first < last);
    let child = ctx.arena.get(term).children[first];
    reduce_subsequent(child, ctx, move |c| {
        reduce_children_ordered_async(term, first + 1, last, c)
    })
}

/// Left-to-right sequencing: the value of the sequence is the value of
/// its final expression. An empty sequence reduces to the unspecified
/// value.
pub fn reduce_ordered(term: TermId, ctx: &mut Context) -> EvalResult<ReductionStatus> {
    if ctx.arena.get(term).is_branch() {
        reduce_sequence_ordered_async(term, ctx, 0)
    } else {
        ctx.arena.get_mut(term).value = Value::Unspecified;
        Ok(ReductionStatus::Retained)
    }
}

fn reduce_sequence_ordered_async(
    term: TermId,
    ctx: &mut Context,
    i: usize,
) -> EvalResult<ReductionStatus> {
    debug_assert!(i < ctx.arena.get(term).children.len());
    let child = ctx.arena.get(term).children[i];
    if i + 1 == ctx.arena.get(term).children.len() {
        return reduce_once_lifted(term, ctx, child);
    }
    ctx.setup_front_guarded(move |c| {
        c.arena.get_mut(term).children.remove(i);
        reduce_sequence_ordered_async(term, c, i)
    });
    reduce_once(child, ctx)
}
