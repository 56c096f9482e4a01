//! Authorization tests
//!
//! OR-of-AND requirement checks, route registration and the route-level
//! authorizer.

use bmcfront::constants::*;
use bmcfront::registry::Requirement;
use bmcfront::{
    is_method_allowed, is_operation_allowed, user_privileges, Authorizer, Decision, Error, OperationMap,
    PrivilegeRegistry, PrivilegeSet, Verb,
};

fn set(names: &[&str]) -> PrivilegeSet {
    PrivilegeSet::from_names(names).unwrap()
}

const ROUTE: &str = "/redfish/v1/Systems/system";

const LOGIN_ONLY: Requirement<'static> = &[&[LOGIN]];
const COMPONENTS_OR_MANAGER: Requirement<'static> = &[&[CONFIGURE_COMPONENTS], &[CONFIGURE_MANAGER]];
const UNKNOWN_NAME: Requirement<'static> = &[&[LOGIN, "ConfigureEverything"]];

// ============================================================================
// is_operation_allowed
// ============================================================================

/// No alternatives means anyone, including a caller with no privileges
#[test]
fn empty_requirement_admits_everyone() {
    assert!(is_operation_allowed(&[], &PrivilegeSet::empty()));
    assert!(is_operation_allowed(&[], &set(&[LOGIN])));
}

/// An alternative with no names is satisfied by every set
#[test]
fn empty_alternative_admits_everyone() {
    assert!(is_operation_allowed(&[PrivilegeSet::empty()], &PrivilegeSet::empty()));
}

#[test]
fn or_of_and_semantics() {
    let required = [set(&[LOGIN, CONFIGURE_SELF]), set(&[CONFIGURE_MANAGER])];

    assert!(is_operation_allowed(&required, &set(&[LOGIN, CONFIGURE_SELF])));
    assert!(is_operation_allowed(&required, &set(&[CONFIGURE_MANAGER])));
    assert!(is_operation_allowed(&required, &set(&[LOGIN, CONFIGURE_SELF, HOST_CONSOLE])));

    // Half of the first alternative is not enough
    assert!(!is_operation_allowed(&required, &set(&[LOGIN])));
    assert!(!is_operation_allowed(&required, &set(&[CONFIGURE_SELF])));
    assert!(!is_operation_allowed(&required, &PrivilegeSet::empty()));
}

/// Granting more privileges never turns an allow into a deny
#[test]
fn allowance_is_monotonic() {
    let required = [set(&[LOGIN, CONFIGURE_COMPONENTS])];
    let mut user = set(&[LOGIN, CONFIGURE_COMPONENTS]);
    for name in PRIVILEGE_NAMES {
        user.grant(name);
        assert!(is_operation_allowed(&required, &user), "after granting {name}");
    }
}

// ============================================================================
// is_method_allowed
// ============================================================================

#[test]
fn missing_verb_is_denied() {
    let mut operations = OperationMap::new();
    operations.insert(Verb::Get, vec![]);

    let admin = user_privileges::<&str>(ROLE_ADMIN, &[]);
    assert!(is_method_allowed(Verb::Get, &operations, &PrivilegeSet::empty()));
    assert!(!is_method_allowed(Verb::Delete, &operations, &admin));
}

#[test]
fn method_uses_verb_requirement() {
    let mut operations = OperationMap::new();
    operations.insert(Verb::Get, vec![set(&[LOGIN])]);
    operations.insert(Verb::Patch, vec![set(&[CONFIGURE_COMPONENTS])]);

    let operator = user_privileges::<&str>(ROLE_OPERATOR, &[]);
    let readonly = user_privileges::<&str>(ROLE_USER, &[]);

    assert!(is_method_allowed(Verb::Patch, &operations, &operator));
    assert!(!is_method_allowed(Verb::Patch, &operations, &readonly));
    assert!(is_method_allowed(Verb::Get, &operations, &readonly));
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn register_and_lookup() {
    let mut registry = PrivilegeRegistry::new();
    registry
        .register(ROUTE, &[(Verb::Get, LOGIN_ONLY), (Verb::Patch, COMPONENTS_OR_MANAGER)])
        .unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.required(ROUTE, Verb::Get), Some(&[set(&[LOGIN])][..]));
    assert_eq!(registry.required(ROUTE, Verb::Patch).map(<[_]>::len), Some(2));
    assert!(registry.required(ROUTE, Verb::Delete).is_none());
    assert!(registry.required("/redfish/v1/Other", Verb::Get).is_none());
    assert_eq!(registry.operations(ROUTE).map(|o| o.len()), Some(2));
}

/// One unknown name rejects the whole route, earlier routes are untouched
#[test]
fn register_rejects_unknown_names() {
    let mut registry = PrivilegeRegistry::new();
    registry.register(ROUTE, &[(Verb::Get, LOGIN_ONLY)]).unwrap();

    let err = registry
        .register("/redfish/v1/Chassis", &[(Verb::Get, LOGIN_ONLY), (Verb::Post, UNKNOWN_NAME)])
        .unwrap_err();

    assert_eq!(err, Error::UnknownPrivilege("ConfigureEverything".into()));
    assert!(registry.operations("/redfish/v1/Chassis").is_none());
    assert_eq!(registry.len(), 1);
    assert!(registry.required(ROUTE, Verb::Get).is_some());
}

#[test]
fn default_registry_covers_served_routes() {
    let registry = PrivilegeRegistry::with_defaults();
    for route in [ROUTE_SERVICE_ROOT, ROUTE_SESSIONS, ROUTE_TASKS, ROUTE_TASK_MONITOR, ROUTE_IST_MODE] {
        assert!(registry.operations(route).is_some(), "{route}");
    }
    assert!(registry.routes().any(|r| r == ROUTE_TASK_UPDATE));
}

// ============================================================================
// Authorizer
// ============================================================================

#[test]
fn authorizer_decisions_by_role() {
    let authz = Authorizer::new(PrivilegeRegistry::with_defaults());
    let admin = user_privileges::<&str>(ROLE_ADMIN, &[]);
    let operator = user_privileges::<&str>(ROLE_OPERATOR, &[]);
    let readonly = user_privileges::<&str>(ROLE_USER, &[]);
    let nobody = PrivilegeSet::empty();

    assert_eq!(authz.authorize(ROUTE_SERVICE_ROOT, Verb::Get, &nobody), Decision::Allowed);
    assert_eq!(authz.authorize(ROUTE_TASKS, Verb::Get, &nobody), Decision::Forbidden);
    assert_eq!(authz.authorize(ROUTE_TASKS, Verb::Get, &readonly), Decision::Allowed);

    // ConfigureManager OR ConfigureComponents
    assert!(authz.authorize(ROUTE_IST_MODE, Verb::Post, &admin).is_allowed());
    assert!(authz.authorize(ROUTE_IST_MODE, Verb::Post, &operator).is_allowed());
    assert!(!authz.authorize(ROUTE_IST_MODE, Verb::Post, &readonly).is_allowed());

    assert!(authz.authorize(ROUTE_TASK_UPDATE, Verb::Patch, &admin).is_allowed());
    assert!(!authz.authorize(ROUTE_TASK_UPDATE, Verb::Patch, &operator).is_allowed());
}

#[test]
fn authorizer_denies_unregistered() {
    let authz = Authorizer::new(PrivilegeRegistry::with_defaults());
    let admin = user_privileges::<&str>(ROLE_ADMIN, &[]);

    assert_eq!(authz.authorize("/redfish/v1/Nowhere", Verb::Get, &admin), Decision::Forbidden);
    assert_eq!(authz.authorize(ROUTE_TASKS, Verb::Delete, &admin), Decision::Forbidden);
}

#[test]
fn session_requirement() {
    let authz = Authorizer::new(PrivilegeRegistry::with_defaults());
    assert!(!authz.requires_session(ROUTE_SERVICE_ROOT, Verb::Get));
    assert!(!authz.requires_session(ROUTE_SESSIONS, Verb::Post));
    assert!(authz.requires_session(ROUTE_SESSIONS, Verb::Get));
    assert!(authz.requires_session("/redfish/v1/Nowhere", Verb::Get));
}

#[test]
fn decision_from_bool() {
    assert_eq!(Decision::from(true), Decision::Allowed);
    assert_eq!(Decision::from(false), Decision::Forbidden);
}
