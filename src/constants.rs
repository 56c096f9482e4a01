//! Privilege names, roles, limits and route patterns

// Privilege bitset width
pub const MAX_PRIVILEGE_COUNT: usize = 32;
// The first BASE_PRIVILEGE_COUNT entries of PRIVILEGE_NAMES are Redfish base privileges, the rest are OEM
pub const BASE_PRIVILEGE_COUNT: usize = 5;

pub const LOGIN: &str = "Login";
pub const CONFIGURE_MANAGER: &str = "ConfigureManager";
pub const CONFIGURE_COMPONENTS: &str = "ConfigureComponents";
pub const CONFIGURE_SELF: &str = "ConfigureSelf";
pub const CONFIGURE_USERS: &str = "ConfigureUsers";
pub const HOST_CONSOLE: &str = "OpenBMCHostConsole";

/// Privilege name table. The position of a name is its bit index and never changes.
pub const PRIVILEGE_NAMES: &[&str] = &[
    LOGIN,
    CONFIGURE_MANAGER,
    CONFIGURE_COMPONENTS,
    CONFIGURE_SELF,
    CONFIGURE_USERS,
    HOST_CONSOLE,
];

// User roles as stored by the account manager
pub const ROLE_ADMIN: &str = "priv-admin";
pub const ROLE_OPERATOR: &str = "priv-operator";
pub const ROLE_USER: &str = "priv-user";

// Members of this group get HOST_CONSOLE
pub const GROUP_HOST_CONSOLE: &str = "hostconsole";

// Redfish role ids
pub const ROLE_ID_ADMINISTRATOR: &str = "Administrator";
pub const ROLE_ID_OPERATOR: &str = "Operator";
pub const ROLE_ID_READ_ONLY: &str = "ReadOnly";

// Tasks
pub const MAX_TASK_COUNT: usize = 100;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 30;
pub const TASK_ODATA_TYPE: &str = "#Task.v1_4_3.Task";

// Filter parser nesting limit (parentheses and `not`)
pub const MAX_FILTER_DEPTH: usize = 32;

// Sessions
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

// Route patterns, shared by the router and the privilege registry
pub const ROUTE_SERVICE_ROOT: &str = "/redfish/v1";
pub const ROUTE_SESSIONS: &str = "/redfish/v1/SessionService/Sessions";
pub const ROUTE_SESSION: &str = "/redfish/v1/SessionService/Sessions/:id";
pub const ROUTE_TASK_SERVICE: &str = "/redfish/v1/TaskService";
pub const ROUTE_TASKS: &str = "/redfish/v1/TaskService/Tasks";
pub const ROUTE_TASK: &str = "/redfish/v1/TaskService/Tasks/:id";
pub const ROUTE_TASK_MONITOR: &str = "/redfish/v1/TaskService/Tasks/:id/Monitor";
pub const ROUTE_TASK_UPDATE: &str = "/redfish/v1/TaskService/Tasks/:id/Update";
pub const ROUTE_ROLE: &str = "/redfish/v1/AccountService/Roles/:id";
pub const ROUTE_IST_MODE: &str = "/redfish/v1/Managers/bmc/Actions/Oem/Manager.SetIstMode";

// Collection URIs
pub const TASK_COLLECTION_URI: &str = "/redfish/v1/TaskService/Tasks";
pub const SESSION_COLLECTION_URI: &str = "/redfish/v1/SessionService/Sessions";
pub const ROLE_COLLECTION_URI: &str = "/redfish/v1/AccountService/Roles";
