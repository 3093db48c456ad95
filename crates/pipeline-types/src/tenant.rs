//! Tenant (company) identity and query scoping.
//!
//! Every read and write is filtered through a [`TenantScope`]. A scope is
//! either bound to one company or unrestricted; the unrestricted scope is
//! reserved for privileged cross-tenant callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Company identifier. This is the isolation boundary for all business data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(String);

impl CompanyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Effective company filter for a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "company", rename_all = "snake_case")]
pub enum TenantScope {
    /// Only rows owned by this company are visible.
    Company(CompanyId),
    /// No company filter.
    Unrestricted,
}

impl TenantScope {
    pub fn company(id: impl Into<String>) -> Self {
        Self::Company(CompanyId::new(id))
    }

    /// The company the filter binds to, or `None` when unrestricted.
    pub fn filter(&self) -> Option<&CompanyId> {
        match self {
            Self::Company(id) => Some(id),
            Self::Unrestricted => None,
        }
    }

    /// Whether a record owned by `owner` is visible through this scope.
    pub fn allows(&self, owner: &CompanyId) -> bool {
        match self {
            Self::Company(id) => id == owner,
            Self::Unrestricted => true,
        }
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Company(id) => write!(f, "company:{id}"),
            Self::Unrestricted => f.write_str("unrestricted"),
        }
    }
}

/// Resolved identity of whoever is making a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub company: CompanyId,
    #[serde(default)]
    pub super_admin: bool,
}

impl Caller {
    pub fn member(company: impl Into<String>) -> Self {
        Self {
            company: CompanyId::new(company),
            super_admin: false,
        }
    }

    pub fn super_admin(company: impl Into<String>) -> Self {
        Self {
            company: CompanyId::new(company),
            super_admin: true,
        }
    }

    /// Scope for offers, projects, sequences and dashboards.
    ///
    /// Membership in the group company does not widen this scope.
    pub fn record_scope(&self) -> TenantScope {
        if self.super_admin {
            TenantScope::Unrestricted
        } else {
            TenantScope::Company(self.company.clone())
        }
    }

    /// Scope for file attachments, where the group company sees every tenant.
    pub fn attachment_scope(&self, directory: &CompanyDirectory) -> TenantScope {
        if self.super_admin || directory.is_group(&self.company) {
            TenantScope::Unrestricted
        } else {
            TenantScope::Company(self.company.clone())
        }
    }
}

/// Known companies and their document-number prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyDirectory {
    prefixes: BTreeMap<CompanyId, String>,
    group: Option<CompanyId>,
}

impl CompanyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_company(mut self, id: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.prefixes.insert(CompanyId::new(id), prefix.into());
        self
    }

    /// Mark one company as the group tenant. It must also be registered.
    pub fn with_group(mut self, id: impl Into<String>) -> Self {
        self.group = Some(CompanyId::new(id));
        self
    }

    pub fn prefix(&self, id: &CompanyId) -> Option<&str> {
        self.prefixes.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &CompanyId) -> bool {
        self.prefixes.contains_key(id)
    }

    pub fn is_group(&self, id: &CompanyId) -> bool {
        self.group.as_ref() == Some(id)
    }

    pub fn group(&self) -> Option<&CompanyId> {
        self.group.as_ref()
    }

    pub fn companies(&self) -> impl Iterator<Item = (&CompanyId, &str)> {
        self.prefixes.iter().map(|(id, p)| (id, p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> CompanyDirectory {
        CompanyDirectory::new()
            .with_company("gruppen", "GR")
            .with_company("stalbygg", "ST")
            .with_group("gruppen")
    }

    #[test]
    fn test_scope_allows_only_own_company() {
        let scope = TenantScope::company("stalbygg");
        assert!(scope.allows(&CompanyId::new("stalbygg")));
        assert!(!scope.allows(&CompanyId::new("gruppen")));
        assert!(TenantScope::Unrestricted.allows(&CompanyId::new("gruppen")));
    }

    #[test]
    fn test_group_member_is_scoped_for_records() {
        let caller = Caller::member("gruppen");
        assert_eq!(caller.record_scope(), TenantScope::company("gruppen"));
    }

    #[test]
    fn test_group_member_sees_all_attachments() {
        let dir = directory();
        assert_eq!(
            Caller::member("gruppen").attachment_scope(&dir),
            TenantScope::Unrestricted
        );
        assert_eq!(
            Caller::member("stalbygg").attachment_scope(&dir),
            TenantScope::company("stalbygg")
        );
    }

    #[test]
    fn test_super_admin_is_unrestricted() {
        let caller = Caller::super_admin("stalbygg");
        assert_eq!(caller.record_scope(), TenantScope::Unrestricted);
        assert_eq!(
            caller.attachment_scope(&directory()),
            TenantScope::Unrestricted
        );
    }

    #[test]
    fn test_directory_prefix_lookup() {
        let dir = directory();
        assert_eq!(dir.prefix(&CompanyId::new("stalbygg")), Some("ST"));
        assert_eq!(dir.prefix(&CompanyId::new("all")), None);
        assert!(dir.is_group(&CompanyId::new("gruppen")));
    }
}
