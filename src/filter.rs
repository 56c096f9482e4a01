//! `$filter` expression parser
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! logical_or     := logical_and ( "or" logical_and )*
//! logical_and    := equality_cmp ( "and" equality_cmp )*
//! equality_cmp   := relational_cmp ( ("eq" | "ne") relational_cmp )*
//! relational_cmp := expression ( ("gt" | "ge" | "lt" | "le") expression )*
//! expression     := "(" logical_or ")" | "not" expression | literal
//! literal        := quoted_string | unquoted_string | unsigned_integer
//! ```
//!
//! The `not` production is only active with [`ParserOptions::allow_not`].
//! Even then `not` is a property name when nothing follows it or when a
//! binary operator does (`not eq 'x'`).
//! Nodes live in an arena owned by [`FilterExpr`] and refer to each other by
//! [`NodeId`]; children always sit before their parent.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::constants::MAX_FILTER_DEPTH;

/// Index of a node in its [`FilterExpr`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqualityOp {
    Equals,
    NotEquals,
}

impl EqualityOp {
    const TOKENS: [(&'static str, EqualityOp); 2] =
        [("eq", EqualityOp::Equals), ("ne", EqualityOp::NotEquals)];

    pub fn token(&self) -> &'static str {
        match self {
            EqualityOp::Equals => "eq",
            EqualityOp::NotEquals => "ne",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationalOp {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl RelationalOp {
    const TOKENS: [(&'static str, RelationalOp); 4] = [
        ("gt", RelationalOp::GreaterThan),
        ("ge", RelationalOp::GreaterThanOrEqual),
        ("lt", RelationalOp::LessThan),
        ("le", RelationalOp::LessThanOrEqual),
    ];

    pub fn token(&self) -> &'static str {
        match self {
            RelationalOp::GreaterThan => "gt",
            RelationalOp::GreaterThanOrEqual => "ge",
            RelationalOp::LessThan => "lt",
            RelationalOp::LessThanOrEqual => "le",
        }
    }
}

/// One AST node. Chains with no `rest` are never built; the parser returns
/// the lone operand instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Integer(u64),
    QuotedString(String),
    /// Property reference, e.g. `Status/Health` or `Members[0]`
    UnquotedString(String),
    Negated(NodeId),
    RelationalComparison {
        first: NodeId,
        rest: Vec<(RelationalOp, NodeId)>,
    },
    EqualityComparison {
        first: NodeId,
        rest: Vec<(EqualityOp, NodeId)>,
    },
    LogicalAnd {
        first: NodeId,
        rest: Vec<NodeId>,
    },
    LogicalOr {
        first: NodeId,
        rest: Vec<NodeId>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserOptions {
    /// Accept the `not` prefix
    pub allow_not: bool,
}

/// Input the grammar could not consume
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid $filter at offset {offset}: expected {expected}, found '{remainder}'")]
pub struct ParseError {
    /// Byte offset where parsing stopped
    pub offset: usize,
    /// Unparsed tail of the input
    pub remainder: String,
    pub expected: &'static str,
}

/// A parsed filter expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpr {
    nodes: Vec<Node>,
    root: NodeId,
}

impl FilterExpr {
    /// Parse with default options (`not` disabled)
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        Self::parse_with(text, ParserOptions::default())
    }

    pub fn parse_with(text: &str, options: ParserOptions) -> Result<Self, ParseError> {
        let mut parser = Parser::new(text, options);
        let root = parser.logical_or();
        if let Some(err) = parser.fatal.take() {
            return Err(err);
        }
        parser.skip_ws();
        match root {
            Some(root) if parser.pos == text.len() => Ok(Self { nodes: parser.nodes, root }),
            Some(_) => Err(parser.error("end of input")),
            None => Err(parser.error("expression")),
        }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    #[inline]
    pub fn root_node(&self) -> &Node {
        self.node(self.root)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn fmt_node(&self, id: NodeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node(id) {
            Node::Integer(n) => write!(f, "{n}"),
            Node::QuotedString(s) => {
                f.write_str("'")?;
                for c in s.chars() {
                    if c == '\'' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("'")
            }
            Node::UnquotedString(s) => f.write_str(s),
            Node::Negated(inner) => {
                f.write_str("(not ")?;
                self.fmt_node(*inner, f)?;
                f.write_str(")")
            }
            Node::RelationalComparison { first, rest } => {
                self.fmt_chain(*first, rest.iter().map(|(op, id)| (op.token(), *id)), f)
            }
            Node::EqualityComparison { first, rest } => {
                self.fmt_chain(*first, rest.iter().map(|(op, id)| (op.token(), *id)), f)
            }
            Node::LogicalAnd { first, rest } => self.fmt_chain(*first, rest.iter().map(|id| ("and", *id)), f),
            Node::LogicalOr { first, rest } => self.fmt_chain(*first, rest.iter().map(|id| ("or", *id)), f),
        }
    }

    fn fmt_chain(
        &self,
        first: NodeId,
        rest: impl Iterator<Item = (&'static str, NodeId)>,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str("(")?;
        self.fmt_node(first, f)?;
        for (token, id) in rest {
            write!(f, " {token} ")?;
            self.fmt_node(id, f)?;
        }
        f.write_str(")")
    }
}

/// Fully parenthesized rendering, one pair of parentheses per chain
impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(self.root, f)
    }
}

impl FromStr for FilterExpr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Characters allowed after the first letter of an unquoted string
#[inline]
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '[' | ']' | '/')
}

/// (input position, arena length) to backtrack to
type Mark = (usize, usize);

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    nodes: Vec<Node>,
    depth: usize,
    options: ParserOptions,
    /// Set on errors that must not be backtracked over
    fatal: Option<ParseError>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, options: ParserOptions) -> Self {
        Self {
            src,
            pos: 0,
            nodes: Vec::new(),
            depth: 0,
            options,
            fatal: None,
        }
    }

    #[inline]
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    #[inline]
    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    #[inline]
    fn mark(&self) -> Mark {
        (self.pos, self.nodes.len())
    }

    #[inline]
    fn reset(&mut self, (pos, len): Mark) {
        self.pos = pos;
        self.nodes.truncate(len);
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn error(&self, expected: &'static str) -> ParseError {
        ParseError {
            offset: self.pos,
            remainder: self.rest().to_string(),
            expected,
        }
    }

    /// Consume `kw` if it appears next as a whole word
    fn keyword(&mut self, kw: &str) -> bool {
        let mark = self.mark();
        self.skip_ws();
        let rest = self.rest();
        if rest.starts_with(kw) && !rest[kw.len()..].chars().next().is_some_and(is_word_char) {
            self.pos += kw.len();
            return true;
        }
        self.reset(mark);
        false
    }

    fn token<T: Copy>(&mut self, table: &[(&'static str, T)]) -> Option<T> {
        table
            .iter()
            .find(|(kw, _)| self.keyword(kw))
            .map(|(_, op)| *op)
    }

    /// Whether a binary operator comes next. Consumes nothing.
    fn at_operator(&mut self) -> bool {
        let mark = self.mark();
        let found = self.keyword("and")
            || self.keyword("or")
            || self.token(&EqualityOp::TOKENS).is_some()
            || self.token(&RelationalOp::TOKENS).is_some();
        self.reset(mark);
        found
    }

    fn enter(&mut self) -> bool {
        if self.depth >= MAX_FILTER_DEPTH {
            self.fatal = Some(self.error("nesting within the depth limit"));
            return false;
        }
        self.depth += 1;
        true
    }

    fn chain<T>(&mut self, first: NodeId, rest: Vec<T>, build: impl FnOnce(NodeId, Vec<T>) -> Node) -> NodeId {
        if rest.is_empty() {
            first
        } else {
            self.push(build(first, rest))
        }
    }

    fn logical_or(&mut self) -> Option<NodeId> {
        let first = self.logical_and()?;
        let mut rest = Vec::new();
        loop {
            let mark = self.mark();
            if !self.keyword("or") {
                break;
            }
            match self.logical_and() {
                Some(id) => rest.push(id),
                None => {
                    self.reset(mark);
                    break;
                }
            }
        }
        Some(self.chain(first, rest, |first, rest| Node::LogicalOr { first, rest }))
    }

    fn logical_and(&mut self) -> Option<NodeId> {
        let first = self.equality()?;
        let mut rest = Vec::new();
        loop {
            let mark = self.mark();
            if !self.keyword("and") {
                break;
            }
            match self.equality() {
                Some(id) => rest.push(id),
                None => {
                    self.reset(mark);
                    break;
                }
            }
        }
        Some(self.chain(first, rest, |first, rest| Node::LogicalAnd { first, rest }))
    }

    fn equality(&mut self) -> Option<NodeId> {
        let first = self.relational()?;
        let mut rest = Vec::new();
        loop {
            let mark = self.mark();
            let Some(op) = self.token(&EqualityOp::TOKENS) else {
                break;
            };
            match self.relational() {
                Some(id) => rest.push((op, id)),
                None => {
                    self.reset(mark);
                    break;
                }
            }
        }
        Some(self.chain(first, rest, |first, rest| Node::EqualityComparison { first, rest }))
    }

    fn relational(&mut self) -> Option<NodeId> {
        let first = self.expression()?;
        let mut rest = Vec::new();
        loop {
            let mark = self.mark();
            let Some(op) = self.token(&RelationalOp::TOKENS) else {
                break;
            };
            match self.expression() {
                Some(id) => rest.push((op, id)),
                None => {
                    self.reset(mark);
                    break;
                }
            }
        }
        Some(self.chain(first, rest, |first, rest| Node::RelationalComparison { first, rest }))
    }

    fn expression(&mut self) -> Option<NodeId> {
        if self.fatal.is_some() {
            return None;
        }
        self.skip_ws();
        let mark = self.mark();

        if self.peek() == Some('(') {
            self.pos += 1;
            if !self.enter() {
                return None;
            }
            let inner = self.logical_or();
            self.depth -= 1;
            if let Some(id) = inner {
                self.skip_ws();
                if self.peek() == Some(')') {
                    self.pos += 1;
                    return Some(id);
                }
            }
            self.reset(mark);
            return None;
        }

        if self.options.allow_not && self.keyword("not") {
            if self.at_operator() {
                self.reset(mark);
                return self.literal();
            }
            if !self.enter() {
                return None;
            }
            let inner = self.expression();
            self.depth -= 1;
            if let Some(id) = inner {
                return Some(self.push(Node::Negated(id)));
            }
            // `not` alone may still be a property name
            self.reset(mark);
        }

        self.literal()
    }

    fn literal(&mut self) -> Option<NodeId> {
        match self.peek()? {
            '\'' => self.quoted_string(),
            c if c.is_ascii_alphabetic() => Some(self.unquoted_string()),
            c if c.is_ascii_digit() => self.integer(),
            _ => None,
        }
    }

    /// `'...'` where a backslash takes the next character literally
    fn quoted_string(&mut self) -> Option<NodeId> {
        let start = self.pos;
        let mut chars = self.rest().char_indices().skip(1);
        let mut value = String::new();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    let (_, escaped) = chars.next()?;
                    value.push(escaped);
                }
                '\'' => {
                    self.pos = start + i + 1;
                    return Some(self.push(Node::QuotedString(value)));
                }
                c => value.push(c),
            }
        }
        None
    }

    fn unquoted_string(&mut self) -> NodeId {
        let rest = self.rest();
        let len = rest.find(|c: char| !is_word_char(c)).unwrap_or(rest.len());
        self.pos += len;
        self.push(Node::UnquotedString(rest[..len].to_string()))
    }

    fn integer(&mut self) -> Option<NodeId> {
        let rest = self.rest();
        let len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        match rest[..len].parse::<u64>() {
            Ok(value) => {
                self.pos += len;
                Some(self.push(Node::Integer(value)))
            }
            Err(_) => {
                self.fatal = Some(self.error("integer within u64 range"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_operand_chains_collapse() {
        let expr = FilterExpr::parse("Name").unwrap();
        assert_eq!(expr.nodes().len(), 1);
        assert_eq!(expr.root_node(), &Node::UnquotedString("Name".into()));
    }

    #[test]
    fn failed_alternatives_leave_no_orphans() {
        let expr = FilterExpr::parse("(a eq 1) or (b eq 2)").unwrap();
        // a, 1, a eq 1, b, 2, b eq 2, or
        assert_eq!(expr.nodes().len(), 7);
        assert_eq!(expr.root().index(), 6);
    }

    #[test]
    fn quoted_display_escapes() {
        let expr = FilterExpr::parse(r"'it\'s'").unwrap();
        assert_eq!(expr.to_string(), r"'it\'s'");
    }
}
