//! Arena - slab storage for the mutable term tree.
use crate::engine::forms::ContextHandler;
use crate::env::EnvWeak;
use crate::tags::TermTags;
use num_bigint::BigInt;
use smallvec::SmallVec;

/// Lightweight term handle into a [`TermArena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TermId(pub u32);

impl TermId {
    pub const NULL: TermId = TermId(u32::MAX);
}

pub type TermChildren = SmallVec<[TermId; 4]>;

/// Contents of a term's value slot.
#[derive(Clone)]
pub enum Value {
    /// Empty slot; a term with no value is a list.
    None,
    /// Identifier produced by the lexer, pending resolution.
    Token(String),
    Int(BigInt),
    Bool(bool),
    Str(String),
    /// The inert result of vacuous evaluation.
    Unspecified,
    Reference(TermReference),
    Combiner(ContextHandler),
    Environment(crate::env::EnvRef),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Value::Token(s) => Some(s),
            _ => None,
        }
    }
}

/// First-class alias to a term living elsewhere.
///
/// Carries the tag set seen through the alias and a weak handle to the
/// environment the referent resides in. Identity of the referent is what
/// matters; references are never compared for equality.
#[derive(Clone)]
pub struct TermReference {
    tags: TermTags,
    referent: TermId,
    env: EnvWeak,
}

impl TermReference {
    pub fn new(tags: TermTags, referent: TermId, env: EnvWeak) -> Self {
        TermReference { tags, referent, env }
    }

    pub fn tags(&self) -> TermTags {
        self.tags
    }

    pub fn referent(&self) -> TermId {
        self.referent
    }

    pub fn environment(&self) -> &EnvWeak {
        &self.env
    }

    /// Same referent and home, different tag view.
    pub fn with_tags(&self, tags: TermTags) -> Self {
        TermReference { tags, referent: self.referent, env: self.env.clone() }
    }

    /// Whether the referent may be moved from: a unique, modifiable
    /// source.
    pub fn is_movable(&self) -> bool {
        self.tags.contains(TermTags::UNIQUE) && !self.tags.contains(TermTags::NONMODIFYING)
    }
}

/// A node in the evaluation tree: ordered children, a value slot, and
/// tags.
pub struct Term {
    pub children: TermChildren,
    pub value: Value,
    pub tags: TermTags,
}

impl Term {
    pub fn list(children: TermChildren) -> Self {
        Term { children, value: Value::None, tags: TermTags::empty() }
    }

    pub fn leaf(value: Value) -> Self {
        Term { children: TermChildren::new(), value, tags: TermTags::empty() }
    }

    pub fn empty_list() -> Self {
        Term::list(TermChildren::new())
    }

    /// Leaf: populated value slot, no children.
    pub fn is_leaf(&self) -> bool {
        !self.value.is_none() && self.children.is_empty()
    }

    /// Branch: at least one child.
    pub fn is_branch(&self) -> bool {
        !self.children.is_empty()
    }

    /// List: empty value slot (the empty list included).
    pub fn is_list(&self) -> bool {
        self.value.is_none()
    }

    /// Branched list: children present, value slot empty.
    pub fn is_branched_list(&self) -> bool {
        self.is_branch() && self.is_list()
    }

    pub fn is_empty_list(&self) -> bool {
        self.children.is_empty() && self.value.is_none()
    }
}

/// Non-interning term storage. Terms mutate in place during reduction, so
/// slots are never shared by construction; sharing only arises from the
/// child-id aliasing the reducers themselves introduce.
pub struct TermArena {
    nodes: Vec<Term>,
}

impl TermArena {
    pub fn new() -> Self {
        TermArena { nodes: Vec::with_capacity(256) }
    }

    pub fn add(&mut self, term: Term) -> TermId {
        let id = TermId(self.nodes.len() as u32);
        self.nodes.push(term);
        id
    }

    pub fn get(&self, id: TermId) -> &Term {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TermId) -> &mut Term {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Structural copy of a whole subtree into fresh slots.
    pub fn deep_copy(&mut self, id: TermId) -> TermId {
        let (children, value, tags) = {
            let t = self.get(id);
            (t.children.clone(), t.value.clone(), t.tags)
        };
        let mut copied = TermChildren::with_capacity(children.len());
        for child in children {
            copied.push(self.deep_copy(child));
        }
        self.add(Term { children: copied, value, tags })
    }
}

impl Default for TermArena {
    fn default() -> Self {
        TermArena::new()
    }
}

/// Transfer `src`'s children and value into `dst`, leaving `src` empty.
/// `dst`'s tags are untouched.
pub fn lift_other(arena: &mut TermArena, dst: TermId, src: TermId) {
    let children = std::mem::take(&mut arena.get_mut(src).children);
    let value = std::mem::replace(&mut arena.get_mut(src).value, Value::None);
    let d = arena.get_mut(dst);
    d.children = children;
    d.value = value;
}

/// Collapse a reference leaf into the value it refers to, moving when the
/// reference permits it and copying otherwise. Non-reference terms are
/// left alone.
pub fn lift_to_return(arena: &mut TermArena, id: TermId) {
    let reference = match &arena.get(id).value {
        Value::Reference(r) => Some(r.clone()),
        _ => None,
    };
    if let Some(r) = reference {
        let src = r.referent();
        if r.is_movable() {
            lift_other(arena, id, src);
        } else {
            let (children, value) = {
                let s = arena.get(src);
                (s.children.clone(), s.value.clone())
            };
            let mut copied = TermChildren::with_capacity(children.len());
            for child in children {
                copied.push(arena.deep_copy(child));
            }
            let t = arena.get_mut(id);
            t.children = copied;
            t.value = value;
        }
    }
}

/// Lift every child of `id` to its returnable form.
pub fn lift_subterms_to_return(arena: &mut TermArena, id: TermId) {
    let children = arena.get(id).children.clone();
    for child in children {
        lift_to_return(arena, child);
    }
}
