//! Predicate trees.
//!
//! Every primitive holds a [`Filter`]: a short list of names plus the
//! [`Combinator`] joining their per-name results. Primitives compose into
//! a binary tree with [`Predicate::and`] / [`Predicate::or`] or the `&` /
//! `|` operators.
//!
//! The same tree is evaluated two ways: against an [`AttributeIndex`] to
//! produce an id set (queries), and against a single [`Node`] (watch
//! dispatch). Both agree for every snapshot.

use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::index::{AttributeIndex, IdSet, Namespace, WILDCARD};
use crate::model::{Node, NodeKind, Value};

/// How the per-name results of one primitive are joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Combinator {
    /// Union.
    #[default]
    Or,
    /// Intersection.
    And,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub names: SmallVec<[String; 2]>,
    pub combinator: Combinator,
}

impl Filter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { names: names.into_iter().map(Into::into).collect(), combinator: Combinator::Or }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Single-node form of the index lookup. `has(name)` reports whether
    /// the node carries `name`; `any()` whether it carries anything at all
    /// in this namespace (what the wildcard resolves to).
    fn test(&self, has: impl Fn(&str) -> bool, any: bool) -> bool {
        if self.names.is_empty() {
            return false;
        }
        let hit = |name: &String| if name == WILDCARD { any } else { has(name) };
        match self.combinator {
            Combinator::Or => self.names.iter().any(hit),
            Combinator::And => self.names.iter().all(hit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Node kind is any of the listed kinds.
    Kind(SmallVec<[NodeKind; 3]>),
    Type(Filter),
    Tag(Filter),
    Group(Filter),
    HasProperty(Filter),
    PropertyEq { name: String, value: Value },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    // ========================================================================
    // Primitives
    // ========================================================================

    pub fn of_type<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::Type(Filter::new(names))
    }

    pub fn tagged<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::Tag(Filter::new(names))
    }

    pub fn member_of<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::Group(Filter::new(groups))
    }

    pub fn has_property<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::HasProperty(Filter::new(names))
    }

    pub fn of_kind(kinds: impl IntoIterator<Item = NodeKind>) -> Self {
        Predicate::Kind(kinds.into_iter().collect())
    }

    /// Property `name` is structurally equal to `value`.
    pub fn property_eq(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::PropertyEq { name: name.into(), value: value.into() }
    }

    // ========================================================================
    // Modifiers
    // ========================================================================

    /// Require every listed name instead of any. No effect on composite
    /// or non-name predicates.
    pub fn all(self) -> Self {
        self.with_combinator(Combinator::And)
    }

    /// Accept any listed name (the default).
    pub fn any(self) -> Self {
        self.with_combinator(Combinator::Or)
    }

    fn with_combinator(mut self, combinator: Combinator) -> Self {
        if let Predicate::Type(f) | Predicate::Tag(f) | Predicate::Group(f) | Predicate::HasProperty(f) = &mut self {
            f.combinator = combinator;
        }
        self
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Ids of every node in `index` satisfying the predicate, in id order.
    pub fn evaluate(&self, index: &AttributeIndex) -> IdSet {
        match self {
            Predicate::Kind(kinds) => kinds.iter().flat_map(|k| index.by_kind(*k)).collect(),
            Predicate::Type(f) => index.lookup(Namespace::Type, f.names.as_slice(), f.combinator),
            Predicate::Tag(f) => index.lookup(Namespace::Tag, f.names.as_slice(), f.combinator),
            Predicate::Group(f) => index.lookup(Namespace::Group, f.names.as_slice(), f.combinator),
            Predicate::HasProperty(f) => index.lookup(Namespace::Property, f.names.as_slice(), f.combinator),
            Predicate::PropertyEq { name, value } => index.by_property_value(name, value),
            Predicate::And(lhs, rhs) => {
                let left = lhs.evaluate(index);
                if left.is_empty() {
                    return left;
                }
                let right = rhs.evaluate(index);
                left.intersection(&right).copied().collect()
            }
            Predicate::Or(lhs, rhs) => {
                let mut left = lhs.evaluate(index);
                left.extend(rhs.evaluate(index));
                left
            }
        }
    }

    /// Whether a single node satisfies the predicate.
    pub fn matches(&self, node: &Node) -> bool {
        match self {
            Predicate::Kind(kinds) => kinds.contains(&node.kind()),
            Predicate::Type(f) => f.test(|name| node.node_type() == name, true),
            Predicate::Tag(f) => f.test(|name| node.has_tag(name), node.tags().next().is_some()),
            Predicate::Group(f) => f.test(|name| node.is_member_of(name), node.groups().next().is_some()),
            Predicate::HasProperty(f) => f.test(|name| node.has_property(name), !node.properties().is_empty()),
            Predicate::PropertyEq { name, value } => node.get(name) == Some(value),
            Predicate::And(lhs, rhs) => lhs.matches(node) && rhs.matches(node),
            Predicate::Or(lhs, rhs) => lhs.matches(node) || rhs.matches(node),
        }
    }
}

impl BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        self.and(rhs)
    }
}

impl BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        self.or(rhs)
    }
}
