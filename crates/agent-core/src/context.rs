//! Security context attached to workflows and agent registrations
//!
//! The `SecurityContext` is a flexible key-value store, like the request
//! context the API layer builds, with typed accessors for the identity and
//! permission fields the orchestrator requires.

use crate::{Error, Payload, Result};
use serde::{Deserialize, Serialize};

/// Well-known security context keys
pub mod keys {
    /// Identity of the caller
    pub const USER_ID: &str = "user_id";
    /// Granted permissions (array of strings)
    pub const PERMISSIONS: &str = "permissions";
    /// Tenant the caller acts for
    pub const TENANT_ID: &str = "tenant_id";
    /// Session ID for tracking
    pub const SESSION_ID: &str = "session_id";
}

/// Identity and permission data passed through to agent execution
///
/// # Example
///
/// ```
/// use agent_core::SecurityContext;
///
/// let ctx = SecurityContext::new()
///     .with_user_id("user-1")
///     .with_permissions(["workflow:execute"]);
///
/// assert!(ctx.validate().is_ok());
/// assert!(ctx.has_permission("workflow:execute"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityContext {
    data: Payload,
}

impl SecurityContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing JSON object
    pub fn from_payload(data: Payload) -> Self {
        Self { data }
    }

    // =========== Builder Methods ===========

    /// Set the user ID
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.insert(keys::USER_ID, serde_json::json!(user_id.into()));
        self
    }

    /// Set the granted permissions
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permissions: Vec<String> = permissions.into_iter().map(Into::into).collect();
        self.insert(keys::PERMISSIONS, serde_json::json!(permissions));
        self
    }

    /// Set the tenant ID
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.insert(keys::TENANT_ID, serde_json::json!(tenant_id.into()));
        self
    }

    // =========== Common Accessors ===========

    /// Get the user ID
    pub fn user_id(&self) -> Option<&str> {
        self.get(keys::USER_ID).and_then(|v| v.as_str())
    }

    /// Get the tenant ID
    pub fn tenant_id(&self) -> Option<&str> {
        self.get(keys::TENANT_ID).and_then(|v| v.as_str())
    }

    /// Iterate over the granted permissions
    pub fn permissions(&self) -> impl Iterator<Item = &str> {
        self.get(keys::PERMISSIONS)
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str())
    }

    /// Check whether a permission was granted
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions().any(|p| p == permission)
    }

    /// Check the required identity and permission fields
    ///
    /// `user_id` must be a non-empty string and `permissions` an array of
    /// strings.
    pub fn validate(&self) -> Result<()> {
        match self.user_id() {
            Some(id) if !id.trim().is_empty() => {}
            Some(_) => {
                return Err(Error::InvalidSecurityContext(
                    "user_id must not be empty".to_string(),
                ));
            }
            None => {
                return Err(Error::InvalidSecurityContext(format!(
                    "missing required field '{}'",
                    keys::USER_ID
                )));
            }
        }

        let Some(permissions) = self.get(keys::PERMISSIONS) else {
            return Err(Error::InvalidSecurityContext(format!(
                "missing required field '{}'",
                keys::PERMISSIONS
            )));
        };
        let valid = permissions
            .as_array()
            .is_some_and(|items| items.iter().all(serde_json::Value::is_string));
        if !valid {
            return Err(Error::InvalidSecurityContext(
                "permissions must be an array of strings".to_string(),
            ));
        }

        Ok(())
    }

    // =========== Generic Key-Value Operations ===========

    /// Insert a value into the context
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Get a value from the context
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Borrow the underlying JSON object
    pub fn as_payload(&self) -> &Payload {
        &self.data
    }

    /// Check if the context is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_chain() {
        let ctx = SecurityContext::new()
            .with_user_id("user-1")
            .with_tenant_id("acme")
            .with_permissions(["agents:register", "workflow:execute"]);

        assert_eq!(ctx.user_id(), Some("user-1"));
        assert_eq!(ctx.tenant_id(), Some("acme"));
        assert_eq!(ctx.permissions().count(), 2);
        assert!(ctx.has_permission("agents:register"));
        assert!(!ctx.has_permission("admin"));
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn test_missing_user_id() {
        let ctx = SecurityContext::new().with_permissions(["read"]);
        let err = ctx.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidSecurityContext(msg) if msg.contains("user_id")));
    }

    #[test]
    fn test_missing_permissions() {
        let ctx = SecurityContext::new().with_user_id("user-1");
        assert!(matches!(
            ctx.validate(),
            Err(Error::InvalidSecurityContext(_))
        ));
    }

    #[test]
    fn test_malformed_permissions() {
        let mut ctx = SecurityContext::new().with_user_id("user-1");
        ctx.insert(keys::PERMISSIONS, json!("everything"));
        assert!(ctx.validate().is_err());

        ctx.insert(keys::PERMISSIONS, json!(["ok", 42]));
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_empty_permissions_are_valid() {
        let ctx = SecurityContext::new()
            .with_user_id("user-1")
            .with_permissions(Vec::<String>::new());
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn test_serde_transparent() {
        let ctx: SecurityContext =
            serde_json::from_value(json!({"user_id": "u", "permissions": []})).unwrap();
        assert_eq!(ctx.user_id(), Some("u"));
        assert_eq!(
            serde_json::to_value(&ctx).unwrap(),
            json!({"user_id": "u", "permissions": []})
        );
    }
}
