//! Per-user session access
//!
//! The host web framework owns the session (cookie transport, storage). The
//! protocol engine only needs [`SessionStore`]. [`SessionContext`] is the
//! typed view of what a successful launch leaves behind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::roles::RoleSet;

/// Session keys the engine reads and writes
pub mod keys {
    /// Single-use CSRF state issued at login
    pub const STATE: &str = "lti-state";
    /// Single-use nonce issued at login
    pub const NONCE: &str = "lti-nonce";
    /// Where to go after a successful launch
    pub const NEXT_URL: &str = "next_url";
    /// Issuer
    pub const ISS: &str = "iss";
    /// Audience / client id
    pub const AUD: &str = "aud";
    /// Deployment id
    pub const DEPLOYMENT_ID: &str = "deployment_id";
    /// Subject (platform user id)
    pub const SUB: &str = "sub";
    /// Classified roles
    pub const ROLES: &str = "roles";
    /// Context descriptor
    pub const CONTEXT: &str = "context";
    /// AGS line items container URL
    pub const LINE_ITEMS: &str = "lineitems";
    /// AGS line item URL of the launched resource
    pub const LINE_ITEM: &str = "lineitem";
    /// Resource link id
    pub const RESOURCE_LINK_ID: &str = "resource_link_id";
    /// LTI message type
    pub const MESSAGE_TYPE: &str = "message_type";
    /// NRPS memberships URL
    pub const MEMBERSHIPS_URL: &str = "context_memberships_url";
}

/// Mutable key/value session of one end user
pub trait SessionStore {
    /// Value stored under `name`
    fn get(&self, name: &str) -> Option<Value>;

    /// Store `value` under `name`
    fn set(&mut self, name: &str, value: Value);

    /// Remove `name`, returning the previous value
    fn remove(&mut self, name: &str) -> Option<Value>;

    /// Whether `name` is present and equal to `expected`
    fn validate(&self, name: &str, expected: &Value) -> bool {
        self.get(name).is_some_and(|v| &v == expected)
    }

    /// String stored under `name`
    fn get_str(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// `HashMap`-backed session for hosts without their own store, and tests
#[derive(Debug, Clone, Default)]
pub struct MemorySession(HashMap<String, Value>);

impl MemorySession {
    /// Empty session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `name` is stored
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}

impl SessionStore for MemorySession {
    fn get(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: Value) {
        self.0.insert(name.to_string(), value);
    }

    fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }
}

/// Course context of a launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDescriptor {
    /// Context id
    pub id: String,
    /// Short label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Context types (e.g. `CourseSection`)
    #[serde(default, rename = "type", skip_serializing_if = "Vec::is_empty")]
    pub kind: Vec<String>,
}

/// Where a session is in the login/launch handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// No handshake started
    Unauthenticated,
    /// Login issued state and nonce; waiting for the launch post
    LoginInitiated,
    /// A launch completed
    Launched,
}

impl LaunchState {
    /// Derive the state from session contents
    pub fn of<S: SessionStore + ?Sized>(session: &S) -> Self {
        if session.get(keys::STATE).is_some() || session.get(keys::NONCE).is_some() {
            Self::LoginInitiated
        } else if session.get(keys::SUB).is_some() && session.get(keys::DEPLOYMENT_ID).is_some() {
            Self::Launched
        } else {
            Self::Unauthenticated
        }
    }
}

/// Typed view of the values a launch stores in the session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    /// Issuer
    pub iss: Option<String>,
    /// Audience / client id
    pub aud: Option<String>,
    /// Deployment id
    pub deployment_id: Option<String>,
    /// Subject
    pub sub: Option<String>,
    /// Classified roles
    pub roles: RoleSet,
    /// Course context
    pub context: Option<ContextDescriptor>,
    /// AGS line items container URL
    pub line_items_url: Option<String>,
    /// AGS line item URL of the launched resource
    pub line_item_url: Option<String>,
    /// Resource link id
    pub resource_link_id: Option<String>,
    /// LTI message type
    pub message_type: Option<String>,
    /// NRPS memberships URL
    pub memberships_url: Option<String>,
}

fn typed<T: DeserializeOwned, S: SessionStore + ?Sized>(session: &S, name: &str) -> Option<T> {
    session
        .get(name)
        .and_then(|v| serde_json::from_value(v).ok())
}

fn put<S: SessionStore + ?Sized>(session: &mut S, name: &str, value: Option<&String>) {
    match value {
        Some(value) => session.set(name, Value::String(value.clone())),
        None => {
            session.remove(name);
        }
    }
}

fn put_json<S: SessionStore + ?Sized, T: Serialize>(session: &mut S, name: &str, value: Option<&T>) {
    match value.and_then(|v| serde_json::to_value(v).ok()) {
        Some(value) => session.set(name, value),
        None => {
            session.remove(name);
        }
    }
}

impl SessionContext {
    /// Read the context back from a session
    pub fn from_session<S: SessionStore + ?Sized>(session: &S) -> Self {
        Self {
            iss: session.get_str(keys::ISS),
            aud: session.get_str(keys::AUD),
            deployment_id: session.get_str(keys::DEPLOYMENT_ID),
            sub: session.get_str(keys::SUB),
            roles: typed(session, keys::ROLES).unwrap_or_default(),
            context: typed(session, keys::CONTEXT),
            line_items_url: session.get_str(keys::LINE_ITEMS),
            line_item_url: session.get_str(keys::LINE_ITEM),
            resource_link_id: session.get_str(keys::RESOURCE_LINK_ID),
            message_type: session.get_str(keys::MESSAGE_TYPE),
            memberships_url: session.get_str(keys::MEMBERSHIPS_URL),
        }
    }

    /// Replace the session's launch fields with this context.
    ///
    /// Absent fields are removed, so nothing survives from an earlier launch.
    pub fn store<S: SessionStore + ?Sized>(&self, session: &mut S) {
        put(session, keys::ISS, self.iss.as_ref());
        put(session, keys::AUD, self.aud.as_ref());
        put(session, keys::DEPLOYMENT_ID, self.deployment_id.as_ref());
        put(session, keys::SUB, self.sub.as_ref());
        put(session, keys::LINE_ITEMS, self.line_items_url.as_ref());
        put(session, keys::LINE_ITEM, self.line_item_url.as_ref());
        put(session, keys::RESOURCE_LINK_ID, self.resource_link_id.as_ref());
        put(session, keys::MESSAGE_TYPE, self.message_type.as_ref());
        put(session, keys::MEMBERSHIPS_URL, self.memberships_url.as_ref());
        let roles = (!self.roles.is_empty()).then_some(&self.roles);
        put_json(session, keys::ROLES, roles);
        put_json(session, keys::CONTEXT, self.context.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::RoleScope;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn memory_session_get_set_remove_validate() {
        let mut session = MemorySession::new();

        session.set("param", json!(123));
        assert_eq!(session.get("param"), Some(json!(123)));
        assert!(session.validate("param", &json!(123)));
        assert!(!session.validate("param", &json!(124)));

        assert_eq!(session.remove("param"), Some(json!(123)));
        assert_eq!(session.get("param"), None);
        assert!(!session.validate("param", &json!(123)));
    }

    #[test]
    fn get_str_ignores_non_strings() {
        let mut session = MemorySession::new();
        session.set("sub", json!(3));
        assert_eq!(session.get_str("sub"), None);
    }

    #[test]
    fn context_round_trips_through_session() {
        let mut roles = RoleSet::default();
        roles.insert(RoleScope::Context, "Instructor");
        let ctx = SessionContext {
            iss: Some("http://localhost/moodle".into()),
            aud: Some("client-a".into()),
            deployment_id: Some("4".into()),
            sub: Some("2".into()),
            roles,
            context: Some(ContextDescriptor {
                id: "2".into(),
                label: Some("aaaa".into()),
                title: Some("Aaaa".into()),
                kind: vec!["CourseSection".into()],
            }),
            line_items_url: Some(
                "http://localhost/moodle/mod/lti/services.php/2/lineitems?type_id=4".into(),
            ),
            ..SessionContext::default()
        };

        let mut session = MemorySession::new();
        ctx.store(&mut session);

        assert_eq!(SessionContext::from_session(&session), ctx);
        assert_eq!(session.get(keys::ROLES), Some(json!({"context": "Instructor"})));
    }

    #[test]
    fn storing_sparse_context_clears_previous_fields() {
        let mut roles = RoleSet::default();
        roles.insert(RoleScope::Context, "Instructor");
        let full = SessionContext {
            iss: Some("http://localhost/moodle".into()),
            aud: Some("client-a".into()),
            sub: Some("2".into()),
            roles,
            context: Some(ContextDescriptor {
                id: "2".into(),
                ..ContextDescriptor::default()
            }),
            line_items_url: Some("http://localhost/moodle/lineitems".into()),
            memberships_url: Some("http://localhost/moodle/memberships".into()),
            ..SessionContext::default()
        };
        let sparse = SessionContext {
            iss: Some("http://localhost/moodle".into()),
            aud: Some("client-a".into()),
            sub: Some("99".into()),
            ..SessionContext::default()
        };

        let mut session = MemorySession::new();
        session.set(keys::STATE, json!("s"));
        full.store(&mut session);
        sparse.store(&mut session);

        assert_eq!(SessionContext::from_session(&session), sparse);
        assert!(!session.contains(keys::ROLES));
        assert!(!session.contains(keys::CONTEXT));
        assert!(!session.contains(keys::LINE_ITEMS));
        // CSRF fields are not part of the context
        assert!(session.contains(keys::STATE));
    }

    #[test]
    fn launch_state_follows_session_contents() {
        let mut session = MemorySession::new();
        assert_eq!(LaunchState::of(&session), LaunchState::Unauthenticated);

        session.set(keys::STATE, json!("s"));
        session.set(keys::NONCE, json!("n"));
        assert_eq!(LaunchState::of(&session), LaunchState::LoginInitiated);

        session.remove(keys::STATE);
        session.remove(keys::NONCE);
        session.set(keys::SUB, json!("2"));
        session.set(keys::DEPLOYMENT_ID, json!("4"));
        assert_eq!(LaunchState::of(&session), LaunchState::Launched);
    }
}
