//! Filter evaluation against resource properties
//!
//! Evaluation never fails. An unknown property, a string on either side of a
//! relational operator, or operands of different types make the containing
//! comparison false.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::filter::{EqualityOp, FilterExpr, Node, NodeId, RelationalOp};

/// A scalar property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Integer(u64),
    String(String),
    Boolean(bool),
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Integer(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

/// Resolves property paths (`Status/Health`, `Links/Members[0]`) for one resource
pub trait PropertySource {
    fn property(&self, path: &str) -> Option<PropertyValue>;
}

impl PropertySource for HashMap<String, PropertyValue> {
    fn property(&self, path: &str) -> Option<PropertyValue> {
        self.get(path).cloned()
    }
}

/// Walks `/`-separated segments; `Name[n]` indexes into an array.
impl PropertySource for Value {
    fn property(&self, path: &str) -> Option<PropertyValue> {
        let mut current = self;
        for segment in path.split('/') {
            let (name, indices) = match segment.find('[') {
                Some(i) => (&segment[..i], &segment[i..]),
                None => (segment, ""),
            };
            if !name.is_empty() {
                current = current.get(name)?;
            }
            for index in indices.split_terminator(']') {
                let n: usize = index.strip_prefix('[')?.parse().ok()?;
                current = current.get(n)?;
            }
        }
        match current {
            Value::Bool(b) => Some(PropertyValue::Boolean(*b)),
            Value::Number(n) => n.as_u64().map(PropertyValue::Integer),
            Value::String(s) => Some(PropertyValue::String(s.clone())),
            _ => None,
        }
    }
}

/// Result of evaluating one node
#[derive(Debug, Clone, PartialEq)]
enum Evaluated {
    Value(PropertyValue),
    Bool(bool),
    Missing,
}

impl Evaluated {
    fn truthy(&self) -> bool {
        match self {
            Evaluated::Bool(b) | Evaluated::Value(PropertyValue::Boolean(b)) => *b,
            Evaluated::Value(PropertyValue::Integer(n)) => *n != 0,
            Evaluated::Value(PropertyValue::String(_)) | Evaluated::Missing => false,
        }
    }

    fn scalar(self) -> Option<PropertyValue> {
        match self {
            Evaluated::Value(v) => Some(v),
            Evaluated::Bool(b) => Some(PropertyValue::Boolean(b)),
            Evaluated::Missing => None,
        }
    }
}

fn compare_equal(op: EqualityOp, lhs: &PropertyValue, rhs: &PropertyValue) -> Option<bool> {
    let equal = match (lhs, rhs) {
        (PropertyValue::Integer(a), PropertyValue::Integer(b)) => a == b,
        (PropertyValue::String(a), PropertyValue::String(b)) => a == b,
        (PropertyValue::Boolean(a), PropertyValue::Boolean(b)) => a == b,
        _ => return None,
    };
    Some(match op {
        EqualityOp::Equals => equal,
        EqualityOp::NotEquals => !equal,
    })
}

fn compare_relational(op: RelationalOp, lhs: &PropertyValue, rhs: &PropertyValue) -> Option<bool> {
    let (PropertyValue::Integer(a), PropertyValue::Integer(b)) = (lhs, rhs) else {
        return None;
    };
    let ord = a.cmp(b);
    Some(match op {
        RelationalOp::GreaterThan => ord == Ordering::Greater,
        RelationalOp::GreaterThanOrEqual => ord != Ordering::Less,
        RelationalOp::LessThan => ord == Ordering::Less,
        RelationalOp::LessThanOrEqual => ord != Ordering::Greater,
    })
}

struct Evaluator<'a, S: PropertySource + ?Sized> {
    expr: &'a FilterExpr,
    source: &'a S,
}

impl<S: PropertySource + ?Sized> Evaluator<'_, S> {
    fn eval(&self, id: NodeId) -> Evaluated {
        match self.expr.node(id) {
            Node::Integer(n) => Evaluated::Value(PropertyValue::Integer(*n)),
            Node::QuotedString(s) => Evaluated::Value(PropertyValue::String(s.clone())),
            Node::UnquotedString(path) => match self.source.property(path) {
                Some(v) => Evaluated::Value(v),
                None => Evaluated::Missing,
            },
            Node::Negated(inner) => Evaluated::Bool(!self.eval(*inner).truthy()),
            Node::RelationalComparison { first, rest } => {
                self.fold_comparison(*first, rest, |op, a, b| compare_relational(*op, a, b))
            }
            Node::EqualityComparison { first, rest } => {
                self.fold_comparison(*first, rest, |op, a, b| compare_equal(*op, a, b))
            }
            Node::LogicalAnd { first, rest } => Evaluated::Bool(
                std::iter::once(first)
                    .chain(rest)
                    .all(|id| self.eval(*id).truthy()),
            ),
            Node::LogicalOr { first, rest } => Evaluated::Bool(
                std::iter::once(first)
                    .chain(rest)
                    .any(|id| self.eval(*id).truthy()),
            ),
        }
    }

    /// Left fold: `a op1 b op2 c` is `(a op1 b) op2 c`. Any unresolvable step
    /// makes the whole chain false.
    fn fold_comparison<Op>(
        &self,
        first: NodeId,
        rest: &[(Op, NodeId)],
        compare: impl Fn(&Op, &PropertyValue, &PropertyValue) -> Option<bool>,
    ) -> Evaluated {
        let Some(mut lhs) = self.eval(first).scalar() else {
            return Evaluated::Bool(false);
        };
        for (op, id) in rest {
            let Some(rhs) = self.eval(*id).scalar() else {
                return Evaluated::Bool(false);
            };
            match compare(op, &lhs, &rhs) {
                Some(result) => lhs = PropertyValue::Boolean(result),
                None => return Evaluated::Bool(false),
            }
        }
        Evaluated::Value(lhs)
    }
}

impl FilterExpr {
    /// Whether a resource with the given properties passes the filter
    pub fn matches<S: PropertySource + ?Sized>(&self, source: &S) -> bool {
        Evaluator { expr: self, source }.eval(self.root()).truthy()
    }
}

/// Keep the members that match `expr`, in order
pub fn filter_members(expr: &FilterExpr, members: Vec<Value>) -> Vec<Value> {
    members.into_iter().filter(|m| expr.matches(m)).collect()
}
