//! Current-user context
//!
//! Signaling warm-up is user-scoped and the backend needs the caller's id on
//! every call operation, so the coordinator resolves the signed-in user from
//! the auth layer before anything else.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Role of a signed-in user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserType {
    /// Resident; the only role that receives intercom calls
    #[serde(rename = "morador")]
    Resident,
    /// Doorman; places intercom calls
    #[serde(rename = "porteiro")]
    Doorman,
    /// Building administrator
    #[serde(rename = "admin")]
    Admin,
}

impl UserType {
    /// Whether intercom calls are delivered to this role
    pub fn receives_calls(self) -> bool {
        matches!(self, UserType::Resident)
    }

    /// Role name the call API expects in `userType`
    pub fn api_role(self) -> &'static str {
        match self {
            UserType::Resident => "resident",
            UserType::Doorman => "doorman",
            UserType::Admin => "admin",
        }
    }
}

/// The signed-in user on this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    /// Profile id, also the signaling peer id
    pub id: String,
    /// Role
    pub user_type: UserType,
    /// Name for display
    pub display_name: Option<String>,
}

impl CurrentUser {
    /// A resident user
    pub fn resident(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_type: UserType::Resident,
            display_name: None,
        }
    }
}

impl fmt::Display for CurrentUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.id, self.user_type)
    }
}

/// Auth errors
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// Auth backend could not be reached
    #[error("Auth backend unavailable: {0}")]
    Unavailable(String),
}

/// Source of the signed-in user and API credentials
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolve the signed-in user's profile, `None` when signed out
    async fn current_user(&self) -> Result<Option<CurrentUser>, AuthError>;

    /// Bearer token for the call API, if any
    async fn access_token(&self) -> Option<String>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_type_wire_names() {
        let json = serde_json::to_string(&UserType::Resident).unwrap();
        assert_eq!(json, "\"morador\"");
        let parsed: UserType = serde_json::from_str("\"porteiro\"").unwrap();
        assert_eq!(parsed, UserType::Doorman);
    }

    #[test]
    fn test_only_residents_receive_calls() {
        assert!(UserType::Resident.receives_calls());
        assert!(!UserType::Doorman.receives_calls());
        assert!(!UserType::Admin.receives_calls());
        assert_eq!(UserType::Resident.api_role(), "resident");
    }

    #[test]
    fn test_current_user_display() {
        let user = CurrentUser::resident("u-1");
        assert_eq!(user.to_string(), "u-1 (Resident)");
    }
}
