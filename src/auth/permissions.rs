// Permission and role checks

use std::collections::BTreeSet;

use super::types::Identity;

/// What a page or action asks of the signed-in user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    /// All of these must be granted
    pub permissions: Vec<String>,
    /// At least one of these must be granted (ignored when empty)
    pub roles: Vec<String>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn is_satisfied_by(&self, permissions: &BTreeSet<String>, roles: &BTreeSet<String>) -> bool {
        let has_permissions = self
            .permissions
            .iter()
            .all(|permission| permissions.contains(permission));

        let has_role = self.roles.is_empty() || self.roles.iter().any(|role| roles.contains(role));

        has_permissions && has_role
    }

    pub fn is_satisfied_by_identity(&self, identity: &Identity) -> bool {
        self.is_satisfied_by(&identity.permissions, &identity.roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(permissions: &[&str], roles: &[&str]) -> Identity {
        Identity {
            email: "diego@rocketseat.team".to_string(),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_requirements_always_pass() {
        assert!(Requirements::new().is_satisfied_by_identity(&identity(&[], &[])));
    }

    #[test]
    fn test_all_permissions_required() {
        let requirements = Requirements::new()
            .permission("metrics.list")
            .permission("users.list");

        assert!(requirements.is_satisfied_by_identity(&identity(
            &["metrics.list", "users.list", "users.create"],
            &[]
        )));
        assert!(!requirements.is_satisfied_by_identity(&identity(&["metrics.list"], &[])));
    }

    #[test]
    fn test_any_role_suffices() {
        let requirements = Requirements::new().role("administrator").role("editor");

        assert!(requirements.is_satisfied_by_identity(&identity(&[], &["editor"])));
        assert!(!requirements.is_satisfied_by_identity(&identity(&[], &["viewer"])));
    }

    #[test]
    fn test_permissions_and_roles_combined() {
        let requirements = Requirements::new()
            .permission("metrics.list")
            .role("administrator");

        assert!(requirements
            .is_satisfied_by_identity(&identity(&["metrics.list"], &["administrator"])));
        assert!(!requirements.is_satisfied_by_identity(&identity(&["metrics.list"], &["editor"])));
        assert!(!requirements.is_satisfied_by_identity(&identity(&[], &["administrator"])));
    }
}
