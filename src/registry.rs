//! Per-route privilege requirements

use std::collections::HashMap;
use std::fmt;

use tracing::{error, warn};

use crate::constants::{
    CONFIGURE_COMPONENTS, CONFIGURE_MANAGER, LOGIN, ROUTE_IST_MODE, ROUTE_ROLE, ROUTE_SERVICE_ROOT,
    ROUTE_SESSION, ROUTE_SESSIONS, ROUTE_TASK, ROUTE_TASKS, ROUTE_TASK_MONITOR, ROUTE_TASK_SERVICE,
    ROUTE_TASK_UPDATE,
};
use crate::error::Result;
use crate::privileges::PrivilegeSet;

/// HTTP verbs that carry privilege requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub const ALL: [Verb; 6] = [Verb::Get, Verb::Head, Verb::Post, Verb::Put, Verb::Patch, Verb::Delete];

    /// Parse an HTTP method name, ignoring case
    pub fn from_method(method: &str) -> Option<Verb> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(method))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verb to OR-of-AND privilege alternatives
pub type OperationMap = HashMap<Verb, Vec<PrivilegeSet>>;

/// Privilege names as written in route tables: alternatives of name groups
pub type Requirement<'a> = &'a [&'a [&'a str]];

/// Immutable-after-startup table of route requirements
#[derive(Debug, Clone, Default)]
pub struct PrivilegeRegistry {
    routes: HashMap<String, OperationMap>,
}

impl PrivilegeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route's requirements.
    ///
    /// Every name is validated before anything is inserted: a single unknown
    /// name rejects the whole route and leaves previously registered routes alone.
    pub fn register(&mut self, route: &str, operations: &[(Verb, Requirement<'_>)]) -> Result<()> {
        let mut map = OperationMap::new();
        for (verb, alternatives) in operations {
            let mut sets = Vec::with_capacity(alternatives.len());
            for names in alternatives.iter() {
                let set = PrivilegeSet::from_names(names).map_err(|e| {
                    warn!(route, verb = %verb, error = %e, "rejecting route registration");
                    e
                })?;
                sets.push(set);
            }
            map.insert(*verb, sets);
        }
        self.routes.insert(route.to_string(), map);
        Ok(())
    }

    pub fn operations(&self, route: &str) -> Option<&OperationMap> {
        self.routes.get(route)
    }

    /// Alternatives for (route, verb); `None` means the pair is unregistered
    pub fn required(&self, route: &str, verb: Verb) -> Option<&[PrivilegeSet]> {
        self.routes.get(route)?.get(&verb).map(Vec::as_slice)
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Requirements for every route the HTTP front end serves
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (route, operations) in DEFAULT_ROUTES {
            // Only fails if DEFAULT_ROUTES names a privilege missing from the table
            let result = registry.register(route, operations);
            debug_assert!(result.is_ok(), "built-in route {route} rejected");
            if let Err(e) = result {
                error!(route, error = %e, "built-in route table is broken");
            }
        }
        registry
    }
}

const NONE: &[&[&str]] = &[];
const LOGIN_ONLY: &[&[&str]] = &[&[LOGIN]];
const MANAGER_ONLY: &[&[&str]] = &[&[CONFIGURE_MANAGER]];
const MANAGER_OR_COMPONENTS: &[&[&str]] = &[&[CONFIGURE_MANAGER], &[CONFIGURE_COMPONENTS]];

const DEFAULT_ROUTES: &[(&str, &[(Verb, Requirement<'static>)])] = &[
    (ROUTE_SERVICE_ROOT, &[(Verb::Get, NONE), (Verb::Head, NONE)]),
    (ROUTE_SESSIONS, &[(Verb::Get, LOGIN_ONLY), (Verb::Post, NONE)]),
    (ROUTE_SESSION, &[(Verb::Get, LOGIN_ONLY), (Verb::Delete, LOGIN_ONLY)]),
    (ROUTE_TASK_SERVICE, &[(Verb::Get, LOGIN_ONLY)]),
    (ROUTE_TASKS, &[(Verb::Get, LOGIN_ONLY)]),
    (ROUTE_TASK, &[(Verb::Get, LOGIN_ONLY)]),
    (ROUTE_TASK_MONITOR, &[(Verb::Get, LOGIN_ONLY)]),
    (ROUTE_TASK_UPDATE, &[(Verb::Patch, MANAGER_ONLY)]),
    (ROUTE_ROLE, &[(Verb::Get, LOGIN_ONLY)]),
    (ROUTE_IST_MODE, &[(Verb::Post, MANAGER_OR_COMPONENTS)]),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_parsing_ignores_case() {
        assert_eq!(Verb::from_method("patch"), Some(Verb::Patch));
        assert_eq!(Verb::from_method("GET"), Some(Verb::Get));
        assert_eq!(Verb::from_method("OPTIONS"), None);
    }

    #[test]
    fn defaults_cover_every_route() {
        let registry = PrivilegeRegistry::with_defaults();
        assert_eq!(registry.len(), DEFAULT_ROUTES.len());
        assert_eq!(registry.required(ROUTE_SERVICE_ROOT, Verb::Get).map(|r| r.is_empty()), Some(true));
        assert_eq!(registry.required(ROUTE_IST_MODE, Verb::Post).map(|r| r.len()), Some(2));
    }

    #[test]
    fn default_table_names_are_all_known() {
        for (route, operations) in DEFAULT_ROUTES {
            for (_, alternatives) in operations.iter() {
                for names in alternatives.iter() {
                    assert!(PrivilegeSet::from_names(names).is_ok(), "{route}: {names:?}");
                }
            }
        }
    }
}
