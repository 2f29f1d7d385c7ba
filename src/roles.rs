//! LTI role classification and authorization checks
//!
//! Launch tokens carry role URNs such as
//! `http://purl.imsglobal.org/vocab/lis/v2/membership#Instructor`. They are
//! reduced to a [`RoleSet`]: one role name per scope (`context`,
//! `institution`, `system`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Scope a role applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleScope {
    /// Course / membership roles
    Context,
    /// Institution roles
    Institution,
    /// System roles
    System,
}

impl RoleScope {
    /// Marker that classifies a role URN into this scope
    fn marker(self) -> &'static str {
        match self {
            Self::Context => "membership",
            Self::Institution => "institution",
            Self::System => "system",
        }
    }

    const ALL: [Self; 3] = [Self::Institution, Self::Context, Self::System];
}

/// Context roles by privilege, highest first
pub const CONTEXT_ROLE_PRIORITY: [&str; 4] = ["Administrator", "Instructor", "Mentor", "Learner"];

fn rank(role: &str) -> usize {
    CONTEXT_ROLE_PRIORITY
        .iter()
        .position(|r| *r == role)
        .unwrap_or(CONTEXT_ROLE_PRIORITY.len())
}

/// Strip the vocabulary prefix up to the last `#`
#[must_use]
pub fn short_role_name(role: &str) -> &str {
    role.rsplit_once('#').map_or(role, |(_, name)| name)
}

/// Scope name to role name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(BTreeMap<RoleScope, String>);

impl RoleSet {
    /// Classify role URNs.
    ///
    /// A URN lands in every scope whose marker it contains. When one scope
    /// receives several roles, the higher-ranked name is kept.
    pub fn from_claims<S: AsRef<str>>(roles: &[S]) -> Self {
        let mut set = BTreeMap::new();
        for urn in roles {
            let urn = urn.as_ref();
            let name = short_role_name(urn);
            for scope in RoleScope::ALL {
                if !urn.contains(scope.marker()) {
                    continue;
                }
                set.entry(scope)
                    .and_modify(|current: &mut String| {
                        if rank(name) < rank(current) {
                            *current = name.to_string();
                        }
                    })
                    .or_insert_with(|| name.to_string());
            }
        }
        Self(set)
    }

    /// Role name for `scope`
    #[must_use]
    pub fn get(&self, scope: RoleScope) -> Option<&str> {
        self.0.get(&scope).map(String::as_str)
    }

    /// Set the role name for `scope`
    pub fn insert(&mut self, scope: RoleScope, role: impl Into<String>) {
        self.0.insert(scope, role.into());
    }

    /// Whether no scope has a role
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Highest-privilege known context role, if any
    #[must_use]
    pub fn main_context_role_name(&self) -> Option<&'static str> {
        let context = self.get(RoleScope::Context)?;
        CONTEXT_ROLE_PRIORITY
            .iter()
            .copied()
            .find(|role| context.contains(role))
    }
}

/// Minimum context role an action requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredRole {
    /// Administrators only
    Administrator,
    /// Instructors and administrators
    Instructor,
    /// Learners, instructors and administrators
    Learner,
}

impl RequiredRole {
    /// Context role names admitted by this requirement
    #[must_use]
    pub fn privileges(self) -> &'static [&'static str] {
        match self {
            Self::Administrator => &["Administrator"],
            Self::Instructor => &["Administrator", "Instructor"],
            Self::Learner => &["Administrator", "Instructor", "Learner"],
        }
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The action may proceed
    Permit,
    /// The action must be refused
    Deny,
}

impl Decision {
    /// Whether this is [`Decision::Permit`]
    #[must_use]
    pub fn is_permit(self) -> bool {
        self == Self::Permit
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permit => f.write_str("permit"),
            Self::Deny => f.write_str("You do not have permission to this action"),
        }
    }
}

/// Check a session's roles against a requirement
#[must_use]
pub fn authorize(roles: &RoleSet, required: RequiredRole) -> Decision {
    match roles.main_context_role_name() {
        Some(role) if required.privileges().contains(&role) => Decision::Permit,
        _ => Decision::Deny,
    }
}
