//! Term tags - the value-category lattice carried by terms and references.
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Bitset of ownership/aliasing constraints on a term or reference.
///
/// `UNIQUE` marks a sole owner (an rvalue, safe to move from), `TEMPORARY`
/// a materialized rvalue, and `NONMODIFYING` forbids mutation through the
/// tagged handle.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TermTags(u8);

impl TermTags {
    pub const UNIQUE: TermTags = TermTags(1 << 0);
    pub const NONMODIFYING: TermTags = TermTags(1 << 1);
    pub const TEMPORARY: TermTags = TermTags(1 << 2);

    pub const fn empty() -> Self {
        TermTags(0)
    }

    pub const fn contains(self, other: TermTags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Coerce to the lvalue view: a bound name never owns uniquely.
    pub const fn lvalue(self) -> Self {
        TermTags(self.0 & !Self::UNIQUE.0)
    }

    /// Tags for a reference being bound: a unique source materializes a
    /// temporary alias.
    pub const fn for_binding(self) -> Self {
        if self.contains(Self::UNIQUE) {
            TermTags(self.0 | Self::TEMPORARY.0)
        } else {
            self
        }
    }

    /// Combine constraints when a reference is retagged through another
    /// reference. `NONMODIFYING` survives from either side; `UNIQUE`
    /// survives only when both sides carry it.
    pub const fn propagate_to(self, source: TermTags) -> Self {
        let mut bits = self.0 | (source.0 & Self::NONMODIFYING.0);
        if source.0 & Self::UNIQUE.0 == 0 {
            bits &= !Self::UNIQUE.0;
        }
        TermTags(bits)
    }
}

impl BitOr for TermTags {
    type Output = TermTags;
    fn bitor(self, rhs: TermTags) -> TermTags {
        TermTags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TermTags {
    fn bitor_assign(&mut self, rhs: TermTags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TermTags {
    type Output = TermTags;
    fn bitand(self, rhs: TermTags) -> TermTags {
        TermTags(self.0 & rhs.0)
    }
}

impl BitAndAssign for TermTags {
    fn bitand_assign(&mut self, rhs: TermTags) {
        self.0 &= rhs.0;
    }
}

impl Not for TermTags {
    type Output = TermTags;
    fn not(self) -> TermTags {
        TermTags(!self.0 & 0x7)
    }
}

impl fmt::Debug for TermTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::UNIQUE) {
            parts.push("Unique");
        }
        if self.contains(Self::NONMODIFYING) {
            parts.push("Nonmodifying");
        }
        if self.contains(Self::TEMPORARY) {
            parts.push("Temporary");
        }
        if parts.is_empty() {
            f.write_str("TermTags()")
        } else {
            write!(f, "TermTags({})", parts.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tags() -> Vec<TermTags> {
        let mut out = Vec::new();
        for bits in 0..8u8 {
            let mut t = TermTags::empty();
            if bits & 1 != 0 {
                t |= TermTags::UNIQUE;
            }
            if bits & 2 != 0 {
                t |= TermTags::NONMODIFYING;
            }
            if bits & 4 != 0 {
                t |= TermTags::TEMPORARY;
            }
            out.push(t);
        }
        out
    }

    #[test]
    fn lvalue_clears_unique() {
        for t in all_tags() {
            assert!(!t.lvalue().contains(TermTags::UNIQUE));
            assert_eq!(
                t.lvalue().contains(TermTags::NONMODIFYING),
                t.contains(TermTags::NONMODIFYING)
            );
        }
    }

    #[test]
    fn binding_unique_implies_temporary() {
        for t in all_tags() {
            let b = t.for_binding();
            if t.contains(TermTags::UNIQUE) {
                assert!(b.contains(TermTags::TEMPORARY), "unique binding must materialize: {:?}", t);
            } else {
                assert_eq!(b, t);
            }
        }
    }

    #[test]
    fn propagate_rules() {
        for dst in all_tags() {
            for src in all_tags() {
                let p = dst.propagate_to(src);
                assert_eq!(
                    p.contains(TermTags::NONMODIFYING),
                    dst.contains(TermTags::NONMODIFYING) || src.contains(TermTags::NONMODIFYING),
                    "nonmodifying must survive from either side: {:?} {:?}",
                    dst,
                    src
                );
                assert_eq!(
                    p.contains(TermTags::UNIQUE),
                    dst.contains(TermTags::UNIQUE) && src.contains(TermTags::UNIQUE),
                    "unique must need both sides: {:?} {:?}",
                    dst,
                    src
                );
            }
        }
    }

    #[test]
    fn propagate_idempotent() {
        // Exhaustive sweep over the whole lattice.
        for dst in all_tags() {
            for src in all_tags() {
                let once = dst.propagate_to(src);
                assert_eq!(once.propagate_to(src), once, "{:?} {:?}", dst, src);
            }
        }
    }
}
