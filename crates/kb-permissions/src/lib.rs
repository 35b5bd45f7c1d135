//! Permission Engine (C9): the single predicate `P(U, R)` from spec §4.9,
//! implemented once and consumed two ways — [`is_visible`] as an
//! in-process `bool` check for C2 reads/writes, and
//! [`permission_query_fragment`] compiled into a [`kb_index::MustClause`]
//! for C3 queries. Neither caller re-derives the logic.

use std::collections::BTreeSet;

use kb_core::document::Visibility;
use kb_core::role::RoleCode;
use kb_core::user::AuthContext;
use kb_error::KbError;
use kb_index::MustClause;
use uuid::Uuid;

/// Anything the predicate can be evaluated against: a `DocumentVersion`,
/// a `Chunk`'s `ChunkMetadata`, or any future record carrying the same
/// ownership/visibility/sharing shape.
pub trait PermissionedRecord {
    fn owner_id(&self) -> Option<Uuid>;
    fn org_id(&self) -> Option<Uuid>;
    fn visibility(&self) -> Visibility;
    fn shared_with_users(&self) -> &BTreeSet<Uuid>;
    fn shared_with_roles(&self) -> &BTreeSet<RoleCode>;
}

impl PermissionedRecord for kb_core::DocumentVersion {
    fn owner_id(&self) -> Option<Uuid> {
        self.owner_id
    }
    fn org_id(&self) -> Option<Uuid> {
        self.org_id
    }
    fn visibility(&self) -> Visibility {
        self.visibility
    }
    fn shared_with_users(&self) -> &BTreeSet<Uuid> {
        &self.shared_user_ids
    }
    fn shared_with_roles(&self) -> &BTreeSet<RoleCode> {
        &self.shared_role_codes
    }
}

impl PermissionedRecord for kb_core::chunk::ChunkMetadata {
    fn owner_id(&self) -> Option<Uuid> {
        self.owner_id
    }
    fn org_id(&self) -> Option<Uuid> {
        self.org_id
    }
    fn visibility(&self) -> Visibility {
        self.visibility
    }
    fn shared_with_users(&self) -> &BTreeSet<Uuid> {
        &self.shared_with_users
    }
    fn shared_with_roles(&self) -> &BTreeSet<RoleCode> {
        &self.shared_with_roles
    }
}

/// `P(U, R)` from spec §4.9. An unauthenticated caller must be modeled by
/// [`AuthContext::anonymous`], which satisfies only `visibility = public`.
pub fn is_visible(ctx: &AuthContext, record: &impl PermissionedRecord) -> bool {
    if ctx.is_superuser {
        return true;
    }
    if ctx.user_id.is_some() && record.owner_id() == ctx.user_id {
        return true;
    }
    if record.visibility() == Visibility::Public {
        return true;
    }
    if record.visibility() == Visibility::Organization
        && ctx.org_id.is_some()
        && record.org_id() == ctx.org_id
    {
        return true;
    }
    if let Some(uid) = ctx.user_id {
        if record.shared_with_users().contains(&uid) {
            return true;
        }
    }
    if !ctx.role_codes.is_empty()
        && record
            .shared_with_roles()
            .iter()
            .any(|r| ctx.role_codes.contains(r))
    {
        return true;
    }
    false
}

/// Compiles `P(U, ·)` into a [`MustClause`] fragment for C3, built with
/// boolean `should`-equivalent `AnyOf` and `minimum_should_match: 1`
/// semantics baked into `AnyOf`'s own evaluation. Returns `None` for a
/// superuser, since no filter is needed — the caller should treat `None`
/// as "admit everything" rather than an empty, always-false clause.
pub fn permission_query_fragment(ctx: &AuthContext) -> Option<MustClause> {
    if ctx.is_superuser {
        return None;
    }

    let mut branches = vec![MustClause::Term {
        field: "metadata.visibility".to_string(),
        value: visibility_wire(Visibility::Public),
    }];

    if let Some(uid) = ctx.user_id {
        branches.push(MustClause::Term {
            field: "metadata.owner_id".to_string(),
            value: uid.to_string(),
        });
        branches.push(MustClause::Contains {
            field: "metadata.shared_with_users".to_string(),
            value: uid.to_string(),
        });
    }

    if let Some(org_id) = ctx.org_id {
        branches.push(MustClause::AllOf(vec![
            MustClause::Term {
                field: "metadata.visibility".to_string(),
                value: visibility_wire(Visibility::Organization),
            },
            MustClause::Term {
                field: "metadata.org_id".to_string(),
                value: org_id.to_string(),
            },
        ]));
    }

    if !ctx.role_codes.is_empty() {
        branches.push(MustClause::ContainsAny {
            field: "metadata.shared_with_roles".to_string(),
            values: ctx.role_codes.iter().map(|r| r.as_str().to_string()).collect(),
        });
    }

    Some(MustClause::AnyOf(branches))
}

fn visibility_wire(v: Visibility) -> String {
    format!("{v:?}")
}

/// Convenience wrapper for write paths (C2, C9 callers) that need a
/// `Result` rather than a `bool`: `Err(Forbidden)` carries no detail about
/// *why*, mirroring spec §7's rule that authorization failures must not
/// leak the existence or shape of a record the caller cannot see.
pub fn require_visible(ctx: &AuthContext, record: &impl PermissionedRecord) -> kb_error::Result<()> {
    if is_visible(ctx, record) {
        Ok(())
    } else {
        Err(KbError::forbidden("not permitted to access this record"))
    }
}

/// `private → organization → public` is the only direction freely
/// allowed to an owner/superuser per spec §4.9's visibility state
/// machine; any other caller needing a visibility change must go through
/// a share operation instead, which is not gated by this function.
pub fn can_change_visibility(ctx: &AuthContext, record: &impl PermissionedRecord, next: Visibility) -> bool {
    let owns = ctx.is_superuser || (ctx.user_id.is_some() && record.owner_id() == ctx.user_id);
    owns && record.visibility().is_forward_transition_to(next)
}

/// `shared_with_*` sets may only contain users within the same
/// organization as the record, unless the share is superuser-initiated
/// (spec §4.9: "shared_with_* sets may only contain users within the
/// same organization or (for superuser-initiated shares) any user").
pub fn can_share_with_user(ctx: &AuthContext, record_org_id: Option<Uuid>, target_user_org_id: Option<Uuid>) -> bool {
    ctx.is_superuser || (record_org_id.is_some() && record_org_id == target_user_org_id)
}


#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::document::Visibility;
    use kb_core::role::RoleCode;
    use kb_core::user::AuthContext;
    use std::collections::BTreeSet;

    struct Record {
        owner_id: Option<Uuid>,
        org_id: Option<Uuid>,
        visibility: Visibility,
        shared_with_users: BTreeSet<Uuid>,
        shared_with_roles: BTreeSet<RoleCode>,
    }

    impl PermissionedRecord for Record {
        fn owner_id(&self) -> Option<Uuid> {
            self.owner_id
        }
        fn org_id(&self) -> Option<Uuid> {
            self.org_id
        }
        fn visibility(&self) -> Visibility {
            self.visibility
        }
        fn shared_with_users(&self) -> &BTreeSet<Uuid> {
            &self.shared_with_users
        }
        fn shared_with_roles(&self) -> &BTreeSet<RoleCode> {
            &self.shared_with_roles
        }
    }

    fn private_record(owner: Uuid, org: Uuid) -> Record {
        Record {
            owner_id: Some(owner),
            org_id: Some(org),
            visibility: Visibility::Private,
            shared_with_users: BTreeSet::new(),
            shared_with_roles: BTreeSet::new(),
        }
    }

    #[test]
    fn owner_always_sees_their_own_record() {
        let owner = Uuid::new_v4();
        let org = Uuid::new_v4();
        let record = private_record(owner, org);
        let ctx = AuthContext {
            user_id: Some(owner),
            org_id: Some(org),
            role_codes: BTreeSet::new(),
            is_superuser: false,
        };
        assert!(is_visible(&ctx, &record));
    }

    #[test]
    fn stranger_in_same_org_cannot_see_private_record() {
        let owner = Uuid::new_v4();
        let org = Uuid::new_v4();
        let record = private_record(owner, org);
        let ctx = AuthContext {
            user_id: Some(Uuid::new_v4()),
            org_id: Some(org),
            role_codes: BTreeSet::new(),
            is_superuser: false,
        };
        assert!(!is_visible(&ctx, &record));
    }

    #[test]
    fn organization_visibility_requires_same_org() {
        let owner = Uuid::new_v4();
        let org = Uuid::new_v4();
        let mut record = private_record(owner, org);
        record.visibility = Visibility::Organization;

        let same_org = AuthContext {
            user_id: Some(Uuid::new_v4()),
            org_id: Some(org),
            role_codes: BTreeSet::new(),
            is_superuser: false,
        };
        assert!(is_visible(&same_org, &record));

        let other_org = AuthContext {
            user_id: Some(Uuid::new_v4()),
            org_id: Some(Uuid::new_v4()),
            role_codes: BTreeSet::new(),
            is_superuser: false,
        };
        assert!(!is_visible(&other_org, &record));
    }

    #[test]
    fn anonymous_only_sees_public() {
        let owner = Uuid::new_v4();
        let org = Uuid::new_v4();
        let mut record = private_record(owner, org);
        let anon = AuthContext::anonymous();
        assert!(!is_visible(&anon, &record));
        record.visibility = Visibility::Public;
        assert!(is_visible(&anon, &record));
    }

    #[test]
    fn shared_users_and_roles_only_augment_visibility() {
        let owner = Uuid::new_v4();
        let org = Uuid::new_v4();
        let mut record = private_record(owner, org);
        let carol = Uuid::new_v4();
        record.shared_with_users.insert(carol);

        let carol_ctx = AuthContext {
            user_id: Some(carol),
            org_id: Some(Uuid::new_v4()),
            role_codes: BTreeSet::new(),
            is_superuser: false,
        };
        assert!(is_visible(&carol_ctx, &record));

        let dave_ctx = AuthContext {
            user_id: Some(Uuid::new_v4()),
            org_id: Some(Uuid::new_v4()),
            role_codes: BTreeSet::new(),
            is_superuser: false,
        };
        assert!(!is_visible(&dave_ctx, &record));
    }

    #[test]
    fn superuser_bypasses_every_predicate() {
        let record = private_record(Uuid::new_v4(), Uuid::new_v4());
        let ctx = AuthContext {
            user_id: Some(Uuid::new_v4()),
            org_id: None,
            role_codes: BTreeSet::new(),
            is_superuser: true,
        };
        assert!(is_visible(&ctx, &record));
    }

    #[test]
    fn superuser_query_fragment_is_none() {
        let ctx = AuthContext {
            user_id: Some(Uuid::new_v4()),
            org_id: None,
            role_codes: BTreeSet::new(),
            is_superuser: true,
        };
        assert!(permission_query_fragment(&ctx).is_none());
    }

    #[test]
    fn anonymous_query_fragment_only_admits_public() {
        let ctx = AuthContext::anonymous();
        let fragment = permission_query_fragment(&ctx).unwrap();
        match fragment {
            MustClause::AnyOf(branches) => {
                assert_eq!(branches.len(), 1);
            }
            other => panic!("expected AnyOf, got {other:?}"),
        }
    }

    #[test]
    fn visibility_transitions_only_go_forward() {
        let owner = Uuid::new_v4();
        let org = Uuid::new_v4();
        let record = private_record(owner, org);
        let ctx = AuthContext {
            user_id: Some(owner),
            org_id: Some(org),
            role_codes: BTreeSet::new(),
            is_superuser: false,
        };
        assert!(can_change_visibility(&ctx, &record, Visibility::Organization));
        assert!(can_change_visibility(&ctx, &record, Visibility::Public));

        let mut public_record = record;
        public_record.visibility = Visibility::Public;
        assert!(!can_change_visibility(&ctx, &public_record, Visibility::Private));
    }

    #[test]
    fn sharing_outside_org_requires_superuser() {
        let org = Uuid::new_v4();
        let other_org = Uuid::new_v4();
        let regular = AuthContext {
            user_id: Some(Uuid::new_v4()),
            org_id: Some(org),
            role_codes: BTreeSet::new(),
            is_superuser: false,
        };
        assert!(!can_share_with_user(&regular, Some(org), Some(other_org)));
        assert!(can_share_with_user(&regular, Some(org), Some(org)));

        let admin = AuthContext {
            user_id: Some(Uuid::new_v4()),
            org_id: Some(org),
            role_codes: BTreeSet::new(),
            is_superuser: true,
        };
        assert!(can_share_with_user(&admin, Some(org), Some(other_org)));
    }
}
