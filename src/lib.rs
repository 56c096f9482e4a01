//! bmcfront - Redfish front-end core
//!
//! Privilege checks against per-route requirements, `$filter` parsing and
//! evaluation, and long-running tasks driven by object-bus signals.

pub mod auth;
pub mod authz;
pub mod bus;
pub mod config;
pub mod constants;
pub mod error;
pub mod eval;
pub mod filter;
pub mod messages;
pub mod privileges;
pub mod registry;
pub mod task;
pub mod task_registry;
pub mod watch;

#[cfg(feature = "server")]
pub mod server;

pub use auth::{SessionStore, UserSession};
pub use authz::{is_method_allowed, is_operation_allowed, Authorizer, Decision};
pub use bus::{Bus, BusError, BusValue, LocalBus, MatchRule, MethodCall, Signal, Subscription};
pub use config::Config;
pub use error::{Error, Result};
pub use eval::{filter_members, PropertySource, PropertyValue};
pub use filter::{EqualityOp, FilterExpr, Node, NodeId, ParseError, ParserOptions, RelationalOp};
pub use messages::{Message, Severity};
pub use privileges::{assigned_privileges, role_id_for, user_privileges, PrivilegeSet, PrivilegeType};
pub use registry::{OperationMap, PrivilegeRegistry, Verb};
pub use task::{Completion, MonitorResponse, Payload, TaskCallback, TaskData, TaskState};
pub use task_registry::{TaskEvent, TaskHandle, TaskLimits, TaskRegistry};
pub use watch::PropertyWatch;
