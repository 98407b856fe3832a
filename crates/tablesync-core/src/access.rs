//! Authorization collaborator.
//!
//! The engine asks an [`AccessPolicy`] two kinds of questions: a table-level
//! one ("may this principal write rows of this table?") before every
//! operation, and a row-level one ("may this principal read/change this
//! particular row?") which depends on the row's [`RowFilterScope`].
//!
//! How principals are authenticated is outside this crate; a [`Principal`] is
//! just an id and a set of group names.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::row::{RowAccess, RowFilterScope};

/// Table-level permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TablePermission {
    /// Read rows the filter scope allows.
    ReadRow,
    /// Insert rows and update rows the filter scope allows.
    WriteRow,
    /// Delete rows the filter scope allows.
    DeleteRow,
    /// Read every row regardless of filter scope.
    UnfilteredRead,
    /// Update every row regardless of filter scope.
    UnfilteredWrite,
    /// Delete every row regardless of filter scope.
    UnfilteredDelete,
    /// Create tables.
    CreateTable,
    /// Redefine a table's schema.
    AlterTable,
}

impl TablePermission {
    /// Every permission, in declaration order.
    pub const ALL: [TablePermission; 8] = [
        TablePermission::ReadRow,
        TablePermission::WriteRow,
        TablePermission::DeleteRow,
        TablePermission::UnfilteredRead,
        TablePermission::UnfilteredWrite,
        TablePermission::UnfilteredDelete,
        TablePermission::CreateTable,
        TablePermission::AlterTable,
    ];
}

impl fmt::Display for TablePermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TablePermission::ReadRow => "READ_ROW",
            TablePermission::WriteRow => "WRITE_ROW",
            TablePermission::DeleteRow => "DELETE_ROW",
            TablePermission::UnfilteredRead => "UNFILTERED_READ",
            TablePermission::UnfilteredWrite => "UNFILTERED_WRITE",
            TablePermission::UnfilteredDelete => "UNFILTERED_DELETE",
            TablePermission::CreateTable => "CREATE_TABLE",
            TablePermission::AlterTable => "ALTER_TABLE",
        };
        f.write_str(name)
    }
}

/// What a caller wants to do with an existing row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RowAction {
    /// See the row.
    Read,
    /// Replace the row's content.
    Write,
    /// Turn the row into a tombstone.
    Delete,
}

impl RowAction {
    /// Table permission that bypasses the filter scope for this action.
    pub fn unfiltered_permission(self) -> TablePermission {
        match self {
            RowAction::Read => TablePermission::UnfilteredRead,
            RowAction::Write => TablePermission::UnfilteredWrite,
            RowAction::Delete => TablePermission::UnfilteredDelete,
        }
    }
}

impl fmt::Display for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowAction::Read => f.write_str("read"),
            RowAction::Write => f.write_str("write"),
            RowAction::Delete => f.write_str("delete"),
        }
    }
}

/// An authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// User id.
    pub id: String,
    /// Groups the user belongs to.
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl Principal {
    /// A principal with no groups.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            groups: BTreeSet::new(),
        }
    }

    /// Add a group membership.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// True when the principal belongs to `group`.
    pub fn in_group(&self, group: Option<&str>) -> bool {
        group.is_some_and(|g| self.groups.contains(g))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Answers authorization questions for the engine.
pub trait AccessPolicy: fmt::Debug + Send + Sync {
    /// May `principal` exercise `permission` on the table?
    fn has_permission(
        &self,
        principal: &Principal,
        app_id: &str,
        table_id: &str,
        permission: TablePermission,
    ) -> bool;

    /// May `principal` perform `action` on a row with `scope`?
    ///
    /// The default rule: an unfiltered permission, row ownership or
    /// membership of the privileged group always allows; otherwise the
    /// scope's default access and group grants decide.
    fn can_access_row(
        &self,
        principal: &Principal,
        app_id: &str,
        table_id: &str,
        action: RowAction,
        scope: &RowFilterScope,
    ) -> bool {
        if self.has_permission(principal, app_id, table_id, action.unfiltered_permission()) {
            return true;
        }
        if scope.row_owner.as_deref() == Some(principal.id.as_str())
            || principal.in_group(scope.group_privileged.as_deref())
        {
            return true;
        }
        scope_allows(principal, action, scope)
    }
}

fn scope_allows(principal: &Principal, action: RowAction, scope: &RowFilterScope) -> bool {
    let modify_group = principal.in_group(scope.group_modify.as_deref());
    match action {
        RowAction::Read => {
            scope.default_access != RowAccess::Hidden
                || modify_group
                || principal.in_group(scope.group_read_only.as_deref())
        }
        RowAction::Write => {
            matches!(scope.default_access, RowAccess::Full | RowAccess::Modify) || modify_group
        }
        RowAction::Delete => scope.default_access == RowAccess::Full,
    }
}

/// Grants everything to everyone.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn has_permission(&self, _: &Principal, _: &str, _: &str, _: TablePermission) -> bool {
        true
    }
}

/// Fixed per-principal permission sets, applied to every table.
///
/// Group grants are supported too: a principal holds the union of its own
/// permissions and those of its groups.
#[derive(Clone, Debug, Default)]
pub struct StaticAccessPolicy {
    users: BTreeMap<String, BTreeSet<TablePermission>>,
    groups: BTreeMap<String, BTreeSet<TablePermission>>,
}

impl StaticAccessPolicy {
    /// A policy that grants nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `permissions` to the user `id`.
    pub fn grant_user<I>(mut self, id: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = TablePermission>,
    {
        self.users.entry(id.into()).or_default().extend(permissions);
        self
    }

    /// Grant `permissions` to members of `group`.
    pub fn grant_group<I>(mut self, group: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = TablePermission>,
    {
        self.groups.entry(group.into()).or_default().extend(permissions);
        self
    }

    /// Wrap into a shareable trait object.
    pub fn shared(self) -> Arc<dyn AccessPolicy> {
        Arc::new(self)
    }
}

impl AccessPolicy for StaticAccessPolicy {
    fn has_permission(
        &self,
        principal: &Principal,
        _app_id: &str,
        _table_id: &str,
        permission: TablePermission,
    ) -> bool {
        let direct = self
            .users
            .get(&principal.id)
            .is_some_and(|perms| perms.contains(&permission));
        direct
            || principal.groups.iter().any(|g| {
                self.groups
                    .get(g)
                    .is_some_and(|perms| perms.contains(&permission))
            })
    }
}

/// The principal and policy a table operation runs under.
#[derive(Clone, Debug)]
pub struct Caller {
    /// Who is calling.
    pub principal: Principal,
    /// Policy consulted for row-level checks.
    pub policy: Arc<dyn AccessPolicy>,
}

impl Caller {
    /// A caller under `policy`.
    pub fn new(principal: Principal, policy: Arc<dyn AccessPolicy>) -> Self {
        Self { principal, policy }
    }

    /// An unrestricted internal caller.
    pub fn system() -> Self {
        Self::new(Principal::new("system"), Arc::new(AllowAll))
    }

    /// Row-level check against the caller's policy.
    pub fn can_access_row(
        &self,
        app_id: &str,
        table_id: &str,
        action: RowAction,
        scope: &RowFilterScope,
    ) -> bool {
        self.policy
            .can_access_row(&self.principal, app_id, table_id, action, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readers() -> StaticAccessPolicy {
        StaticAccessPolicy::new()
            .grant_user("alice", [TablePermission::ReadRow, TablePermission::WriteRow])
            .grant_group("admins", TablePermission::ALL)
    }

    #[test]
    fn static_policy_unions_user_and_group_grants() {
        let policy = readers();
        let alice = Principal::new("alice");
        let bob = Principal::new("bob").with_group("admins");
        let eve = Principal::new("eve");

        assert!(policy.has_permission(&alice, "app", "t", TablePermission::WriteRow));
        assert!(!policy.has_permission(&alice, "app", "t", TablePermission::CreateTable));
        assert!(policy.has_permission(&bob, "app", "t", TablePermission::AlterTable));
        assert!(!policy.has_permission(&eve, "app", "t", TablePermission::ReadRow));
    }

    #[test]
    fn hidden_rows_are_visible_to_owner_and_privileged_only() {
        let policy = readers();
        let scope = RowFilterScope {
            group_privileged: Some("auditors".to_string()),
            ..RowFilterScope::new(RowAccess::Hidden).owned_by("carol")
        };

        let alice = Principal::new("alice");
        let carol = Principal::new("carol");
        let auditor = Principal::new("dan").with_group("auditors");
        let admin = Principal::new("root").with_group("admins");

        assert!(!policy.can_access_row(&alice, "app", "t", RowAction::Read, &scope));
        assert!(policy.can_access_row(&carol, "app", "t", RowAction::Read, &scope));
        assert!(policy.can_access_row(&auditor, "app", "t", RowAction::Delete, &scope));
        // Unfiltered permissions bypass the scope.
        assert!(policy.can_access_row(&admin, "app", "t", RowAction::Write, &scope));
    }

    #[test]
    fn default_access_levels() {
        let policy = readers();
        let alice = Principal::new("alice");
        let check = |access, action| {
            policy.can_access_row(&alice, "app", "t", action, &RowFilterScope::new(access))
        };

        assert!(check(RowAccess::Full, RowAction::Delete));
        assert!(check(RowAccess::Modify, RowAction::Write));
        assert!(!check(RowAccess::Modify, RowAction::Delete));
        assert!(check(RowAccess::ReadOnly, RowAction::Read));
        assert!(!check(RowAccess::ReadOnly, RowAction::Write));
        assert!(!check(RowAccess::Hidden, RowAction::Read));
    }

    #[test]
    fn group_grants_in_scope() {
        let policy = StaticAccessPolicy::new();
        let editor = Principal::new("ed").with_group("editors");
        let scope = RowFilterScope {
            group_modify: Some("editors".to_string()),
            ..RowFilterScope::new(RowAccess::Hidden)
        };
        assert!(policy.can_access_row(&editor, "app", "t", RowAction::Read, &scope));
        assert!(policy.can_access_row(&editor, "app", "t", RowAction::Write, &scope));
        assert!(!policy.can_access_row(&editor, "app", "t", RowAction::Delete, &scope));
    }

    #[test]
    fn allow_all_and_system_caller() {
        let caller = Caller::system();
        let scope = RowFilterScope::new(RowAccess::Hidden).owned_by("someone");
        assert!(caller.can_access_row("app", "t", RowAction::Delete, &scope));
        assert!(AllowAll.has_permission(&Principal::new("x"), "a", "t", TablePermission::AlterTable));
    }
}
