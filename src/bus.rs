//! Object bus abstraction
//!
//! The core only needs two primitives from the bus: subscribe to signals
//! matching a rule, and call a method. [`LocalBus`] provides both in process.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Property-change interface every property watch subscribes to
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("invalid match rule: {0}")]
    InvalidMatch(String),

    #[error("no handler for {interface}.{method}")]
    UnknownMethod { interface: String, method: String },

    #[error("method call failed: {0}")]
    MethodFailed(String),

    #[error("bus disconnected")]
    Disconnected,
}

/// A property or argument value
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    StrArray(Vec<String>),
}

impl BusValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            BusValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            BusValue::UInt(n) => Some(*n),
            BusValue::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BusValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for BusValue {
    fn from(v: bool) -> Self {
        BusValue::Bool(v)
    }
}

impl From<i64> for BusValue {
    fn from(v: i64) -> Self {
        BusValue::Int(v)
    }
}

impl From<u64> for BusValue {
    fn from(v: u64) -> Self {
        BusValue::UInt(v)
    }
}

impl From<f64> for BusValue {
    fn from(v: f64) -> Self {
        BusValue::Double(v)
    }
}

impl From<&str> for BusValue {
    fn from(v: &str) -> Self {
        BusValue::Str(v.to_string())
    }
}

impl From<String> for BusValue {
    fn from(v: String) -> Self {
        BusValue::Str(v)
    }
}

/// A broadcast signal, already decoded
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub path: String,
    pub interface: String,
    pub member: String,
    /// First string argument; the changed interface for PropertiesChanged
    pub arg0: Option<String>,
    pub properties: BTreeMap<String, BusValue>,
}

impl Signal {
    /// A PropertiesChanged signal for `interface` on `path`
    pub fn properties_changed<I, K, V>(path: &str, interface: &str, changed: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<BusValue>,
    {
        Self {
            path: path.to_string(),
            interface: PROPERTIES_INTERFACE.to_string(),
            member: PROPERTIES_CHANGED.to_string(),
            arg0: Some(interface.to_string()),
            properties: changed.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&BusValue> {
        self.properties.get(name)
    }
}

// ============================================================================
// Match rules
// ============================================================================

/// `type='signal',interface='…',member='…',path='…',path_namespace='…',arg0='…'`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub arg0: Option<String>,
}

impl MatchRule {
    pub fn parse(text: &str) -> Result<Self, BusError> {
        let mut rule = MatchRule::default();
        let mut rest = text.trim();
        while !rest.is_empty() {
            let (key, tail) = rest
                .split_once('=')
                .ok_or_else(|| BusError::InvalidMatch(format!("missing '=' in '{rest}'")))?;
            let tail = tail
                .strip_prefix('\'')
                .ok_or_else(|| BusError::InvalidMatch(format!("unquoted value for '{key}'")))?;
            let (value, tail) = tail
                .split_once('\'')
                .ok_or_else(|| BusError::InvalidMatch(format!("unterminated value for '{key}'")))?;
            let value = value.to_string();
            match key.trim() {
                "type" if value == "signal" => {}
                "type" => return Err(BusError::InvalidMatch(format!("unsupported type '{value}'"))),
                "sender" => rule.sender = Some(value),
                "interface" => rule.interface = Some(value),
                "member" => rule.member = Some(value),
                "path" => rule.path = Some(value),
                "path_namespace" => rule.path_namespace = Some(value),
                "arg0" => rule.arg0 = Some(value),
                other => return Err(BusError::InvalidMatch(format!("unknown key '{other}'"))),
            }
            let tail = tail.trim_start();
            rest = match tail.strip_prefix(',') {
                Some(t) => t.trim_start(),
                None if tail.is_empty() => tail,
                None => return Err(BusError::InvalidMatch(format!("expected ',' before '{tail}'"))),
            };
        }
        if rule.path.is_some() && rule.path_namespace.is_some() {
            return Err(BusError::InvalidMatch("path and path_namespace are exclusive".into()));
        }
        Ok(rule)
    }

    /// Rule for PropertiesChanged on `path` for `interface`
    pub fn properties_changed(path: &str, interface: &str) -> Self {
        Self {
            interface: Some(PROPERTIES_INTERFACE.to_string()),
            member: Some(PROPERTIES_CHANGED.to_string()),
            path: Some(path.to_string()),
            arg0: Some(interface.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, signal: &Signal) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        let in_namespace = self.path_namespace.as_deref().map_or(true, |ns| {
            signal.path == ns
                || ns == "/"
                || signal
                    .path
                    .strip_prefix(ns)
                    .is_some_and(|rest| rest.starts_with('/'))
        });
        field(&self.interface, &signal.interface)
            && field(&self.member, &signal.member)
            && field(&self.path, &signal.path)
            && in_namespace
            && self
                .arg0
                .as_deref()
                .map_or(true, |want| signal.arg0.as_deref() == Some(want))
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("type='signal'")?;
        let fields = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("arg0", &self.arg0),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                write!(f, ",{key}='{v}'")?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Calls and subscriptions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<BusValue>,
}

impl MethodCall {
    pub fn new(service: &str, path: &str, interface: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<BusValue>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// Live signal subscription. Dropping it removes the match.
#[derive(Debug)]
pub struct Subscription {
    rule: MatchRule,
    rx: mpsc::UnboundedReceiver<Result<Signal, BusError>>,
}

impl Subscription {
    /// Sender/subscription pair for bus implementations
    pub fn channel(rule: MatchRule) -> (mpsc::UnboundedSender<Result<Signal, BusError>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rule, rx })
    }

    pub fn rule(&self) -> &MatchRule {
        &self.rule
    }

    /// Next signal or subscription error; `None` once the bus side is gone
    pub async fn recv(&mut self) -> Option<Result<Signal, BusError>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    fn subscribe(&self, rule: MatchRule) -> Result<Subscription, BusError>;

    async fn call(&self, call: MethodCall) -> Result<Vec<BusValue>, BusError>;
}

// ============================================================================
// In-process bus
// ============================================================================

type MethodHandler = Arc<dyn Fn(&MethodCall) -> Result<Vec<BusValue>, BusError> + Send + Sync>;

struct Subscriber {
    rule: MatchRule,
    tx: mpsc::UnboundedSender<Result<Signal, BusError>>,
}

#[derive(Default)]
struct LocalBusInner {
    subscribers: Vec<Subscriber>,
    methods: HashMap<(String, String), MethodHandler>,
}

/// In-process bus: signals are fanned out to matching subscriptions, calls
/// go to registered handlers.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Mutex<LocalBusInner>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LocalBusInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Deliver `signal` to every live matching subscription; returns how many got it
    pub fn emit(&self, signal: Signal) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for sub in inner.subscribers.iter().filter(|s| s.rule.matches(&signal)) {
            if sub.tx.send(Ok(signal.clone())).is_ok() {
                delivered += 1;
            }
        }
        debug!(path = %signal.path, member = %signal.member, delivered, "signal emitted");
        delivered
    }

    /// Push `err` to every live subscription
    pub fn fail_subscribers(&self, err: BusError) {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        for sub in &inner.subscribers {
            let _ = sub.tx.send(Err(err.clone()));
        }
    }

    pub fn register_method<F>(&self, interface: &str, method: &str, handler: F)
    where
        F: Fn(&MethodCall) -> Result<Vec<BusValue>, BusError> + Send + Sync + 'static,
    {
        self.lock()
            .methods
            .insert((interface.to_string(), method.to_string()), Arc::new(handler));
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn subscribe(&self, rule: MatchRule) -> Result<Subscription, BusError> {
        let (tx, sub) = Subscription::channel(rule.clone());
        self.lock().subscribers.push(Subscriber { rule, tx });
        Ok(sub)
    }

    async fn call(&self, call: MethodCall) -> Result<Vec<BusValue>, BusError> {
        let handler = self
            .lock()
            .methods
            .get(&(call.interface.clone(), call.method.clone()))
            .cloned();
        let Some(handler) = handler else {
            return Err(BusError::UnknownMethod {
                interface: call.interface,
                method: call.method,
            });
        };
        handler(&call).map_err(|e| {
            error!(interface = %call.interface, method = %call.method, error = %e, "bus call failed");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_rule_parses_and_prints() {
        let text = "type='signal',interface='org.freedesktop.DBus.Properties',member='PropertiesChanged',path='/xyz/bmc',arg0='xyz.Ist'";
        let rule = MatchRule::parse(text).unwrap();
        assert_eq!(rule.path.as_deref(), Some("/xyz/bmc"));
        assert_eq!(rule.to_string(), text);
        assert_eq!(MatchRule::parse(&rule.to_string()).unwrap(), rule);
    }

    #[test]
    fn match_rule_rejects_unknown_keys() {
        assert!(matches!(MatchRule::parse("type='signal',bogus='x'"), Err(BusError::InvalidMatch(_))));
        assert!(matches!(MatchRule::parse("type='method_call'"), Err(BusError::InvalidMatch(_))));
        assert!(matches!(MatchRule::parse("path='/a"), Err(BusError::InvalidMatch(_))));
    }

    #[test]
    fn namespace_matches_children_only() {
        let rule = MatchRule::parse("path_namespace='/xyz/bmc'").unwrap();
        let sig = |path: &str| Signal::properties_changed(path, "i", [("A", 1u64)]);
        assert!(rule.matches(&sig("/xyz/bmc")));
        assert!(rule.matches(&sig("/xyz/bmc/tasks/1")));
        assert!(!rule.matches(&sig("/xyz/bmcx")));
    }
}
