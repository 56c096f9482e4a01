//! Privilege bitsets and role-to-privilege derivation

use std::fmt;

use crate::constants::{
    BASE_PRIVILEGE_COUNT, CONFIGURE_COMPONENTS, CONFIGURE_MANAGER, CONFIGURE_SELF,
    CONFIGURE_USERS, GROUP_HOST_CONSOLE, HOST_CONSOLE, LOGIN, MAX_PRIVILEGE_COUNT,
    PRIVILEGE_NAMES, ROLE_ADMIN, ROLE_ID_ADMINISTRATOR, ROLE_ID_OPERATOR, ROLE_ID_READ_ONLY,
    ROLE_OPERATOR, ROLE_USER,
};
use crate::error::{Error, Result};

const _: () = assert!(PRIVILEGE_NAMES.len() <= MAX_PRIVILEGE_COUNT);

/// Which half of the privilege table a name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeType {
    Base,
    Oem,
}

#[inline]
fn index_of(name: &str) -> Option<usize> {
    PRIVILEGE_NAMES.iter().position(|n| *n == name)
}

/// A set of named privileges, one bit per entry in [`PRIVILEGE_NAMES`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PrivilegeSet(u32);

impl PrivilegeSet {
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a set from privilege names. Fails on the first name not in the table.
    pub fn from_names(names: &[&str]) -> Result<Self> {
        let mut set = Self::empty();
        for name in names {
            if !set.grant(name) {
                return Err(Error::UnknownPrivilege((*name).to_string()));
            }
        }
        Ok(set)
    }

    /// Set the bit for `name`. Returns false, leaving the set untouched, for unknown names.
    #[inline]
    pub fn grant(&mut self, name: &str) -> bool {
        match index_of(name) {
            Some(i) => {
                self.0 |= 1 << i;
                true
            }
            None => false,
        }
    }

    /// Clear the bit for `name`. Returns false for unknown names.
    #[inline]
    pub fn revoke(&mut self, name: &str) -> bool {
        match index_of(name) {
            Some(i) => {
                self.0 &= !(1 << i);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        index_of(name).is_some_and(|i| self.0 & (1 << i) != 0)
    }

    /// True iff every privilege in `other` is also in `self`
    #[inline]
    pub fn is_superset_of(&self, other: &PrivilegeSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersection(&self, other: &PrivilegeSet) -> PrivilegeSet {
        PrivilegeSet(self.0 & other.0)
    }

    #[inline]
    pub fn union(&self, other: &PrivilegeSet) -> PrivilegeSet {
        PrivilegeSet(self.0 | other.0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Granted names from one half of the table, in table order
    pub fn active_names(&self, kind: PrivilegeType) -> Vec<&'static str> {
        let range = match kind {
            PrivilegeType::Base => 0..BASE_PRIVILEGE_COUNT,
            PrivilegeType::Oem => BASE_PRIVILEGE_COUNT..PRIVILEGE_NAMES.len(),
        };
        range
            .filter(|i| self.0 & (1 << i) != 0)
            .map(|i| PRIVILEGE_NAMES[i])
            .collect()
    }

    /// All granted names, base first then OEM
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = self.active_names(PrivilegeType::Base);
        names.extend(self.active_names(PrivilegeType::Oem));
        names
    }
}

impl fmt::Display for PrivilegeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        f.write_str(&self.names().join("+"))
    }
}

// ============================================================================
// Roles
// ============================================================================

const ADMIN_PRIVILEGES: &[&str] = &[
    LOGIN,
    CONFIGURE_MANAGER,
    CONFIGURE_USERS,
    CONFIGURE_SELF,
    CONFIGURE_COMPONENTS,
];
const OPERATOR_PRIVILEGES: &[&str] = &[LOGIN, CONFIGURE_SELF, CONFIGURE_COMPONENTS];
const USER_PRIVILEGES: &[&str] = &[LOGIN, CONFIGURE_SELF];

/// Redfish role ids served under the role collection
pub const ROLE_IDS: &[&str] = &[ROLE_ID_ADMINISTRATOR, ROLE_ID_OPERATOR, ROLE_ID_READ_ONLY];

fn base_privileges_for(role: &str) -> &'static [&'static str] {
    match role {
        ROLE_ADMIN => ADMIN_PRIVILEGES,
        ROLE_OPERATOR => OPERATOR_PRIVILEGES,
        ROLE_USER => USER_PRIVILEGES,
        _ => &[],
    }
}

/// Derive a user's privileges from their role and group memberships.
///
/// Unknown roles get no base privileges. Groups only add OEM privileges.
pub fn user_privileges<S: AsRef<str>>(role: &str, groups: &[S]) -> PrivilegeSet {
    let mut set = PrivilegeSet::empty();
    for name in base_privileges_for(role) {
        set.grant(name);
    }
    if groups.iter().any(|g| g.as_ref() == GROUP_HOST_CONSOLE) {
        set.grant(HOST_CONSOLE);
    }
    set
}

/// Map an account-manager role (`priv-admin`) to its Redfish role id (`Administrator`)
pub fn role_id_for(role: &str) -> Option<&'static str> {
    match role {
        ROLE_ADMIN => Some(ROLE_ID_ADMINISTRATOR),
        ROLE_OPERATOR => Some(ROLE_ID_OPERATOR),
        ROLE_USER => Some(ROLE_ID_READ_ONLY),
        _ => None,
    }
}

/// Privilege names assigned to a Redfish role id
pub fn assigned_privileges(role_id: &str) -> Option<&'static [&'static str]> {
    match role_id {
        ROLE_ID_ADMINISTRATOR => Some(ADMIN_PRIVILEGES),
        ROLE_ID_OPERATOR => Some(OPERATOR_PRIVILEGES),
        ROLE_ID_READ_ONLY => Some(USER_PRIVILEGES),
        _ => None,
    }
}
