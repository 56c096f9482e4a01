//! Authorization decisions
//!
//! A check never fails: a missing route, a missing verb or an unsatisfied
//! requirement all come back as [`Decision::Forbidden`].

use tracing::{debug, info};

use crate::privileges::PrivilegeSet;
use crate::registry::{OperationMap, PrivilegeRegistry, Verb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Forbidden,
}

impl Decision {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allowed
        } else {
            Decision::Forbidden
        }
    }
}

/// True if `user` covers any one of `required`. No alternatives means no restriction.
pub fn is_operation_allowed(required: &[PrivilegeSet], user: &PrivilegeSet) -> bool {
    if required.is_empty() {
        return true;
    }
    for alternative in required {
        if user.is_superset_of(alternative) {
            debug!(required = %alternative, user = %user, "privilege alternative satisfied");
            return true;
        }
        debug!(required = %alternative, user = %user, "privilege alternative not satisfied");
    }
    false
}

/// Look `verb` up in `operations` and check it. A verb missing from the map is denied.
pub fn is_method_allowed(verb: Verb, operations: &OperationMap, user: &PrivilegeSet) -> bool {
    match operations.get(&verb) {
        Some(required) => is_operation_allowed(required, user),
        None => false,
    }
}

/// Route-level authorizer over a registry
#[derive(Debug, Clone)]
pub struct Authorizer {
    registry: PrivilegeRegistry,
}

impl Authorizer {
    pub fn new(registry: PrivilegeRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PrivilegeRegistry {
        &self.registry
    }

    pub fn authorize(&self, route: &str, verb: Verb, user: &PrivilegeSet) -> Decision {
        let Some(required) = self.registry.required(route, verb) else {
            info!(target: "access", route, verb = %verb, user = %user, "denied: no requirement registered");
            return Decision::Forbidden;
        };
        if is_operation_allowed(required, user) {
            return Decision::Allowed;
        }
        info!(target: "access", route, verb = %verb, user = %user, "denied: insufficient privilege");
        for alternative in required {
            debug!(
                target: "access",
                required = %alternative,
                held = %user.intersection(alternative),
                "privileges held of alternative"
            );
        }
        Decision::Forbidden
    }

    /// Whether (route, verb) needs an authenticated caller.
    ///
    /// Unregistered pairs report true so an anonymous caller gets 401 rather than 403.
    pub fn requires_session(&self, route: &str, verb: Verb) -> bool {
        match self.registry.required(route, verb) {
            Some(required) => !is_operation_allowed(required, &PrivilegeSet::empty()),
            None => true,
        }
    }
}
