use crate::arena::{
    lift_subterms_to_return, Term, TermArena, TermChildren, TermId, TermReference, Value,
};
use crate::engine::reduce::eval_debug;
use crate::engine::unparse::term_to_string_with_reference_mark;
use crate::env::{EnvRef, EnvWeak};
use crate::error::{EvalError, EvalResult};
use crate::parser::is_symbol;
use crate::tags::TermTags;
use smallvec::smallvec;
use std::collections::VecDeque;
use std::marker::PhantomData;

const IGNORE: &str = "#ignore";

/// Where a matcher failure came from. Bind failures escape unchanged;
/// tree-traversal failures are subject to the strategy's wrapping policy.
enum MatchError {
    Bind(EvalError),
    Tree(EvalError),
}

type MatchResult = Result<(), MatchError>;

/// Validation strategy for the parameter matcher. The checked strategy
/// raises domain errors; the unchecked one asserts them and is used when
/// the formal tree was validated beforehand.
pub(crate) trait MatchStrategy {
    fn check_back(arena: &TermArena, t: TermId, t_has_ref: bool) -> EvalResult<()>;

    /// Validate a leaf formal and extract the name to bind; `None` means
    /// the leaf is `#ignore` and binds nothing.
    fn handle_leaf(arena: &TermArena, t: TermId, t_has_ref: bool) -> EvalResult<Option<String>>;

    /// Policy for errors raised while traversing the parameter tree.
    fn wrap_tree_error(e: EvalError) -> EvalError;
}

pub(crate) struct ParameterCheck;

impl MatchStrategy for ParameterCheck {
    fn check_back(arena: &TermArena, t: TermId, t_has_ref: bool) -> EvalResult<()> {
        if arena.get(t).is_list() {
            Ok(())
        } else {
            Err(EvalError::FormalParameterType(
                term_to_string_with_reference_mark(arena, t, t_has_ref),
            ))
        }
    }

    fn handle_leaf(arena: &TermArena, t: TermId, t_has_ref: bool) -> EvalResult<Option<String>> {
        match arena.get(t).value.token() {
            Some(n) if n == IGNORE => Ok(None),
            Some(n) if is_symbol(n) => Ok(Some(n.to_string())),
            Some(n) => Err(EvalError::invalid_syntax(format!(
                "Invalid token '{n}' found for the formal parameter."
            ))),
            None => Err(EvalError::FormalParameterType(
                term_to_string_with_reference_mark(arena, t, t_has_ref),
            )),
        }
    }

    fn wrap_tree_error(e: EvalError) -> EvalError {
        match e {
            e @ EvalError::ParameterMismatch(_) => e,
            e => EvalError::nested_invalid_syntax(
                "Failed checking for parameter in a parameter tree (expected a symbol or \
                 '#ignore').",
                e,
            ),
        }
    }
}

pub(crate) struct NoParameterCheck;

impl MatchStrategy for NoParameterCheck {
    fn check_back(arena: &TermArena, t: TermId, _t_has_ref: bool) -> EvalResult<()> {
        debug_assert!(arena.get(t).is_list());
        Ok(())
    }

    fn handle_leaf(arena: &TermArena, t: TermId, _t_has_ref: bool) -> EvalResult<Option<String>> {
        let token = arena.get(t).value.token();
        debug_assert!(token.is_some(), "well-formed formal must be a token leaf");
        match token {
            Some(n) if n != IGNORE => {
                debug_assert!(is_symbol(n));
                Ok(Some(n.to_string()))
            }
            _ => Ok(None),
        }
    }

    fn wrap_tree_error(e: EvalError) -> EvalError {
        e
    }
}

type MatchThunk<T, BT, BV> =
    Box<dyn FnOnce(&mut GParameterMatcher<T, BT, BV>, &mut TermArena) -> MatchResult>;

/// Structural matcher walking a formal tree against an operand tree.
///
/// Subterm recursion never touches the host stack: every pending match is
/// queued as a thunk and the driver drains the queue in FIFO order, so
/// stack usage stays flat no matter how deep the formal tree is.
pub(crate) struct GParameterMatcher<T, BT, BV> {
    bind_trailing: BT,
    bind_value: BV,
    act: VecDeque<MatchThunk<T, BT, BV>>,
    _strategy: PhantomData<T>,
}

impl<T, BT, BV> GParameterMatcher<T, BT, BV>
where
    T: MatchStrategy + 'static,
    BT: Fn(&mut TermArena, TermId, usize, &str, TermTags, &EnvWeak) -> EvalResult<()> + 'static,
    BV: Fn(&mut TermArena, &str, TermId, TermTags, &EnvWeak) -> EvalResult<()> + 'static,
{
    pub(crate) fn new(bind_trailing: BT, bind_value: BV) -> Self {
        GParameterMatcher {
            bind_trailing,
            bind_value,
            act: VecDeque::new(),
            _strategy: PhantomData,
        }
    }

    pub(crate) fn run(
        &mut self,
        arena: &mut TermArena,
        t: TermId,
        o: TermId,
        o_tags: TermTags,
        r_env: EnvWeak,
    ) -> EvalResult<()> {
        let result = self.drain(arena, t, o, o_tags, r_env);
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.act.clear();
                match e {
                    MatchError::Bind(e) => Err(e),
                    MatchError::Tree(e) => Err(T::wrap_tree_error(e)),
                }
            }
        }
    }

    fn drain(
        &mut self,
        arena: &mut TermArena,
        t: TermId,
        o: TermId,
        o_tags: TermTags,
        r_env: EnvWeak,
    ) -> MatchResult {
        self.do_match(arena, t, o, o_tags, r_env, false)?;
        while let Some(act) = self.act.pop_front() {
            act(self, arena)?;
        }
        Ok(())
    }

    fn do_match(
        &mut self,
        arena: &mut TermArena,
        t: TermId,
        o: TermId,
        o_tags: TermTags,
        r_env: EnvWeak,
        t_has_ref: bool,
    ) -> MatchResult {
        if arena.get(t).is_list() {
            if arena.get(t).is_branch() {
                let n_p = arena.get(t).children.len();
                let mut last = n_p;
                let back = arena.get(t).children[n_p - 1];
                if arena.get(back).is_leaf() {
                    match arena.get(back).value.token() {
                        Some(s) => {
                            if !s.is_empty() && s.starts_with('.') {
                                last = n_p - 1;
                            }
                        }
                        None => {
                            T::check_back(arena, back, t_has_ref).map_err(MatchError::Tree)?
                        }
                    }
                }
                let (nd, operand_ref) = resolve_operand(arena, o);
                if arena.get(nd).is_list() {
                    let ellipsis = last != n_p;
                    let n_o = arena.get(nd).children.len();
                    if n_p == n_o || (ellipsis && n_o + 1 >= n_p) {
                        let mut tags = o_tags;
                        let env = match &operand_ref {
                            Some(r) => {
                                let ref_tags = r.tags();
                                tags = (tags & !(TermTags::UNIQUE | TermTags::TEMPORARY))
                                    | (ref_tags & TermTags::UNIQUE);
                                tags = tags.propagate_to(ref_tags);
                                // Adopt the reference's home environment
                                // only while it is alive; bindings must
                                // not record a dead home.
                                match r.environment().upgrade() {
                                    Some(home) => EnvWeak::new(&home),
                                    None => r_env,
                                }
                            }
                            None => r_env,
                        };
                        self.match_subterms(arena, t, 0, last, nd, 0, tags, env, ellipsis)?;
                    } else if !ellipsis {
                        return Err(MatchError::Tree(EvalError::ArityMismatch {
                            expected: n_p,
                            actual: n_o,
                        }));
                    } else {
                        return Err(MatchError::Tree(EvalError::InsufficientTerms(
                            term_to_string_with_reference_mark(arena, nd, operand_ref.is_some()),
                        )));
                    }
                } else {
                    return Err(MatchError::Tree(EvalError::ListTypeError(
                        term_to_string_with_reference_mark(arena, nd, operand_ref.is_some()),
                    )));
                }
            } else {
                let (nd, operand_ref) = resolve_operand(arena, o);
                if !arena.get(nd).is_empty_list() {
                    return Err(MatchError::Tree(EvalError::ParameterMismatch(format!(
                        "Invalid nonempty operand value '{}' found for empty list parameter.",
                        term_to_string_with_reference_mark(arena, nd, operand_ref.is_some())
                    ))));
                }
            }
        } else if let Value::Reference(formal_ref) = &arena.get(t).value {
            // A reference formal: match the dereferenced tree, now under a
            // reference.
            let inner = formal_ref.referent();
            self.act.push_back(Box::new(move |m, a| {
                m.do_match(a, inner, o, o_tags, r_env, true)
            }));
        } else if let Some(name) =
            T::handle_leaf(arena, t, t_has_ref).map_err(MatchError::Tree)?
        {
            (self.bind_value)(arena, &name, o, o_tags, &r_env).map_err(MatchError::Bind)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn match_subterms(
        &mut self,
        arena: &mut TermArena,
        t: TermId,
        i: usize,
        last: usize,
        o_tm: TermId,
        j: usize,
        tags: TermTags,
        r_env: EnvWeak,
        ellipsis: bool,
    ) -> MatchResult {
        if i != last {
            debug_assert!(j < arena.get(o_tm).children.len());
            let formal = arena.get(t).children[i];
            let operand = arena.get(o_tm).children[j];
            // Current pair first, remaining siblings after: FIFO drain
            // keeps textual order without host-stack recursion.
            let pair_env = r_env.clone();
            self.act.push_back(Box::new(move |m, a| {
                m.do_match(a, formal, operand, tags, pair_env, false)
            }));
            self.act.push_back(Box::new(move |m, a| {
                m.match_subterms(a, t, i + 1, last, o_tm, j + 1, tags, r_env, ellipsis)
            }));
            Ok(())
        } else if ellipsis {
            let marker = arena.get(t).children[last];
            let id = match arena.get(marker).value.token() {
                Some(s) => s.to_string(),
                None => {
                    debug_assert!(false, "rest marker must be a token");
                    return Ok(());
                }
            };
            (self.bind_trailing)(arena, o_tm, j, &id, tags, &r_env).map_err(MatchError::Bind)
        } else {
            Ok(())
        }
    }
}

fn resolve_operand(arena: &TermArena, o: TermId) -> (TermId, Option<TermReference>) {
    match &arena.get(o).value {
        Value::Reference(r) => (r.referent(), Some(r.clone())),
        _ => (o, None),
    }
}

/// How a bound term is materialized from its operand.
pub(crate) enum BindSource {
    /// Structural copy of the source term, bound with lvalue tags.
    Copy(TermId),
    /// Content moved (or freshly built) into a new term.
    Move(TermChildren, Value),
}

pub(crate) fn realize_binding(arena: &mut TermArena, source: BindSource) -> TermId {
    match source {
        BindSource::Copy(src) => {
            let copy = arena.deep_copy(src);
            let tags = arena.get(src).tags.lvalue();
            arena.get_mut(copy).tags = tags;
            copy
        }
        BindSource::Move(children, value) => {
            arena.add(Term { children, value, tags: TermTags::empty() })
        }
    }
}

fn mark_temporary_term(arena: &mut TermArena, term: TermId, sigil: Option<char>) {
    if sigil.is_some() {
        let tags = arena.get(term).tags;
        arena.get_mut(term).tags = tags | TermTags::TEMPORARY;
    }
}

/// Strip a leading binding sigil, if any, from `id`.
pub fn extract_sigil(id: &mut &str) -> Option<char> {
    match id.chars().next() {
        Some(c @ ('&' | '%' | '@')) => {
            *id = &id[1..];
            Some(c)
        }
        _ => None,
    }
}

/// Per-leaf ownership and aliasing decision for one formal/operand pair.
///
/// `&` binds by mutable reference, `%` preserves temporariness, `@` binds
/// a non-owning reference, and no sigil binds by value with move or copy
/// chosen from the operand tags.
pub(crate) struct BindParameterObject<'e> {
    pub referenced: &'e EnvWeak,
}

impl<'e> BindParameterObject<'e> {
    pub(crate) fn bind<S>(
        &self,
        arena: &mut TermArena,
        sigil: Option<char>,
        ref_temp: bool,
        o_tags: TermTags,
        o: TermId,
        sink: S,
    ) -> EvalResult<()>
    where
        S: FnOnce(&mut TermArena, BindSource) -> TermId,
    {
        let temp = o_tags.contains(TermTags::TEMPORARY);
        if sigil != Some('@') {
            let can_modify = !o_tags.contains(TermTags::NONMODIFYING);
            let operand_ref = match &arena.get(o).value {
                Value::Reference(r) => Some(r.clone()),
                _ => None,
            };
            if let Some(p) = operand_ref {
                if sigil.is_some() {
                    let base = if ref_temp { p.tags().for_binding() } else { p.tags() };
                    let ref_tags = base.propagate_to(o_tags);
                    let children = if can_modify && temp {
                        std::mem::take(&mut arena.get_mut(o).children)
                    } else {
                        arena.get(o).children.clone()
                    };
                    sink(
                        arena,
                        BindSource::Move(children, Value::Reference(p.with_tags(ref_tags))),
                    );
                } else if p.is_movable() {
                    let src = p.referent();
                    let children = std::mem::take(&mut arena.get_mut(src).children);
                    let value = std::mem::replace(&mut arena.get_mut(src).value, Value::None);
                    sink(arena, BindSource::Move(children, value));
                } else {
                    sink(arena, BindSource::Copy(p.referent()));
                }
            } else if (can_modify || sigil == Some('%')) && temp {
                let children = std::mem::take(&mut arena.get_mut(o).children);
                let value = std::mem::replace(&mut arena.get_mut(o).value, Value::None);
                let bound = sink(arena, BindSource::Move(children, value));
                mark_temporary_term(arena, bound, sigil);
            } else if sigil == Some('&') {
                let tags = (arena.get(o).tags | o_tags).lvalue();
                sink(
                    arena,
                    BindSource::Move(
                        TermChildren::new(),
                        Value::Reference(TermReference::new(tags, o, self.referenced.clone())),
                    ),
                );
            } else {
                sink(arena, BindSource::Copy(o));
            }
            Ok(())
        } else if !temp {
            sink(
                arena,
                BindSource::Move(
                    TermChildren::new(),
                    Value::Reference(TermReference::new(
                        o_tags & TermTags::NONMODIFYING,
                        o,
                        self.referenced.clone(),
                    )),
                ),
            );
            Ok(())
        } else {
            Err(EvalError::InvalidReference(
                "Invalid operand found on binding sigil '@'.".to_string(),
            ))
        }
    }
}

fn bind_parameter_impl<T: MatchStrategy + 'static>(
    arena: &mut TermArena,
    env: &EnvRef,
    t: TermId,
    o: TermId,
) -> EvalResult<()> {
    let trailing_env = env.clone();
    let bind_trailing = move |arena: &mut TermArena,
                              o_tm: TermId,
                              first: usize,
                              id: &str,
                              o_tags: TermTags,
                              r_env: &EnvWeak|
          -> EvalResult<()> {
        debug_assert!(id.starts_with('.'));
        let mut name = &id[1..];
        if name.is_empty() {
            return Ok(());
        }
        let sigil = extract_sigil(&mut name);
        if name.is_empty() {
            // The source quietly discards such a binding; surface it when
            // diagnostics are on.
            if eval_debug(1) {
                eprintln!("BIND_DISCARD kind=trailing sigil={sigil:?}");
            }
            return Ok(());
        }
        let name = name.to_string();
        let last = arena.get(o_tm).children.len();
        if (o_tags & (TermTags::UNIQUE | TermTags::NONMODIFYING)) == TermTags::UNIQUE
            || o_tags.contains(TermTags::TEMPORARY)
        {
            if sigil.is_none() {
                lift_subterms_to_return(arena, o_tm);
            }
            let rest: TermChildren = arena.get_mut(o_tm).children.drain(first..).collect();
            let list = arena.add(Term::list(rest));
            let bound = trailing_env.borrow_mut().bind(&name, list);
            mark_temporary_term(arena, bound, sigil);
        } else {
            let mut con = TermChildren::new();
            for k in first..last {
                let item = arena.get(o_tm).children[k];
                BindParameterObject { referenced: r_env }.bind(
                    arena,
                    sigil,
                    false,
                    o_tags,
                    item,
                    |arena, source| {
                        let bound = realize_binding(arena, source);
                        con.push(bound);
                        bound
                    },
                )?;
            }
            if sigil == Some('&') {
                // An rvalue reference to the freshly materialized list:
                // the list itself rides along as the single child.
                let list = arena.add(Term::list(con));
                let bound = arena.add(Term {
                    children: smallvec![list],
                    value: Value::Reference(TermReference::new(
                        TermTags::empty(),
                        list,
                        r_env.clone(),
                    )),
                    tags: TermTags::empty(),
                });
                trailing_env.borrow_mut().bind(&name, bound);
            } else {
                let list = arena.add(Term::list(con));
                let bound = trailing_env.borrow_mut().bind(&name, list);
                mark_temporary_term(arena, bound, sigil);
            }
        }
        Ok(())
    };

    let value_env = env.clone();
    let bind_value = move |arena: &mut TermArena,
                           n: &str,
                           b: TermId,
                           o_tags: TermTags,
                           r_env: &EnvWeak|
          -> EvalResult<()> {
        debug_assert!(n != IGNORE && is_symbol(n));
        let mut name = n;
        let sigil = extract_sigil(&mut name);
        if name.is_empty() {
            if eval_debug(1) {
                eprintln!("BIND_DISCARD kind=leaf sigil={sigil:?}");
            }
            return Ok(());
        }
        let name = name.to_string();
        let bound_env = &value_env;
        BindParameterObject { referenced: r_env }.bind(
            arena,
            sigil,
            sigil == Some('&'),
            o_tags,
            b,
            |arena, source| {
                let bound = realize_binding(arena, source);
                bound_env.borrow_mut().bind(&name, bound)
            },
        )
    };

    GParameterMatcher::<T, _, _>::new(bind_trailing, bind_value).run(
        arena,
        t,
        o,
        TermTags::TEMPORARY,
        EnvWeak::new(env),
    )
}

/// Match `t` (formal tree) against `o` (operand tree) and populate `env`,
/// with full validation of the formal tree.
pub fn bind_parameter(
    arena: &mut TermArena,
    env: &EnvRef,
    t: TermId,
    o: TermId,
) -> EvalResult<()> {
    bind_parameter_impl::<ParameterCheck>(arena, env, t, o)
}

/// Unchecked variant for formal trees validated ahead of time.
pub fn bind_parameter_well_formed(
    arena: &mut TermArena,
    env: &EnvRef,
    t: TermId,
    o: TermId,
) -> EvalResult<()> {
    bind_parameter_impl::<NoParameterCheck>(arena, env, t, o)
}
