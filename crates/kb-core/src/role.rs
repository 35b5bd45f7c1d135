use serde::{Deserialize, Serialize};

/// Closed set for the core (`admin`, `editor`, `viewer`); additional codes
/// may exist in a deployment without affecting core semantics, so the
/// type stays an open string newtype rather than a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleCode(pub String);

impl RoleCode {
    pub const ADMIN: &'static str = "admin";
    pub const EDITOR: &'static str = "editor";
    pub const VIEWER: &'static str = "viewer";

    pub fn admin() -> Self {
        RoleCode(Self::ADMIN.to_string())
    }

    pub fn editor() -> Self {
        RoleCode(Self::EDITOR.to_string())
    }

    pub fn viewer() -> Self {
        RoleCode(Self::VIEWER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoleCode {
    fn from(s: &str) -> Self {
        RoleCode(s.to_string())
    }
}

impl std::fmt::Display for RoleCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A role definition row; `system_flag` marks the three built-in codes so
/// migrations can tell them apart from deployment-defined extras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub code: RoleCode,
    pub name: String,
    pub system_flag: bool,
}
