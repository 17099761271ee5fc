//! Environments - name bindings forming a lexical parent chain.
use crate::arena::TermId;
use crate::tags::TermTags;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Strong handle to an environment record.
pub type EnvRef = Rc<RefCell<Environment>>;

/// Name-to-term mapping with an optional parent.
///
/// Bound terms live in the term arena; an environment only holds their
/// ids. A frozen environment hands out `NONMODIFYING` default tags for
/// everything resolved through it.
pub struct Environment {
    bindings: FxHashMap<String, TermId>,
    pub parent: Option<EnvRef>,
    pub frozen: bool,
}

impl Environment {
    pub fn new() -> EnvRef {
        Rc::new(RefCell::new(Environment {
            bindings: FxHashMap::default(),
            parent: None,
            frozen: false,
        }))
    }

    pub fn new_derived(parent: EnvRef) -> EnvRef {
        Rc::new(RefCell::new(Environment {
            bindings: FxHashMap::default(),
            parent: Some(parent),
            frozen: false,
        }))
    }

    /// Insert or replace a binding; returns the bound term.
    pub fn bind(&mut self, name: &str, term: TermId) -> TermId {
        self.bindings.insert(name.to_string(), term);
        term
    }

    pub fn lookup_local(&self, name: &str) -> Option<TermId> {
        self.bindings.get(name).copied()
    }

    /// Walk the parent chain; returns the bound term together with the
    /// environment that owns it.
    pub fn resolve(env: &EnvRef, name: &str) -> Option<(TermId, EnvRef)> {
        let mut cur = env.clone();
        loop {
            let next = {
                let e = cur.borrow();
                if let Some(t) = e.lookup_local(name) {
                    return Some((t, cur.clone()));
                }
                e.parent.clone()
            };
            match next {
                Some(p) => cur = p,
                None => return None,
            }
        }
    }

    /// Environment-default tags for terms resolved here.
    pub fn make_term_tags(&self) -> TermTags {
        if self.frozen {
            TermTags::NONMODIFYING
        } else {
            TermTags::empty()
        }
    }
}

/// Non-owning observer of an environment.
///
/// References cannot own their home environment (mutually recursive
/// bindings make cycles); holders must check liveness before use.
#[derive(Clone, Default)]
pub struct EnvWeak(Weak<RefCell<Environment>>);

impl EnvWeak {
    pub fn new(env: &EnvRef) -> Self {
        EnvWeak(Rc::downgrade(env))
    }

    pub fn upgrade(&self) -> Option<EnvRef> {
        self.0.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Term, TermArena, Value};

    #[test]
    fn resolve_walks_parent_chain() {
        let mut arena = TermArena::new();
        let root = Environment::new();
        let child = Environment::new_derived(root.clone());
        let t = arena.add(Term::leaf(Value::Bool(true)));
        root.borrow_mut().bind("x", t);

        let (found, owner) = Environment::resolve(&child, "x").expect("x bound in parent");
        assert_eq!(found, t);
        assert!(Rc::ptr_eq(&owner, &root));
        assert!(Environment::resolve(&child, "y").is_none());
    }

    #[test]
    fn weak_handle_liveness() {
        let env = Environment::new();
        let weak = EnvWeak::new(&env);
        assert!(weak.is_alive());
        drop(env);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn frozen_env_tags() {
        let env = Environment::new();
        assert!(env.borrow().make_term_tags().is_empty());
        env.borrow_mut().frozen = true;
        assert!(env.borrow().make_term_tags().contains(TermTags::NONMODIFYING));
    }
}
