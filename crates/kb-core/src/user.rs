use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::role::RoleCode;

/// A superuser bypasses every permission predicate; `org_id` is `None`
/// only for bootstrap/system accounts that are always superusers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub org_id: Option<Uuid>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub role_codes: BTreeSet<RoleCode>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn has_role(&self, code: &str) -> bool {
        self.role_codes.iter().any(|r| r.as_str() == code)
    }
}

/// Identity used by the permission predicate, including the sentinel
/// unauthenticated caller `{id: nil, org_id: nil, roles: ∅,
/// is_superuser: false}` from spec §4.9.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub role_codes: BTreeSet<RoleCode>,
    pub is_superuser: bool,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        AuthContext {
            user_id: None,
            org_id: None,
            role_codes: BTreeSet::new(),
            is_superuser: false,
        }
    }

    pub fn from_user(user: &User) -> Self {
        AuthContext {
            user_id: Some(user.id),
            org_id: user.org_id,
            role_codes: user.role_codes.clone(),
            is_superuser: user.is_superuser,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}
