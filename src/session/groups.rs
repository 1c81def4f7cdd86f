//! Static role to group table.
//!
//! The reserved group `all` admits every role. Group `open` is handled by the
//! session manager before any lookup happens, so it never reaches this table.

use crate::session::user::User;
use std::collections::{HashMap, HashSet};

pub const GROUP_ALL: &str = "all";
pub const GROUP_OPEN: &str = "open";

#[derive(Clone, Debug, Default)]
pub struct GroupManager {
    groups: HashMap<String, HashSet<String>>,
}

impl GroupManager {
    #[must_use]
    pub fn new(groups: &HashMap<String, Vec<String>>) -> Self {
        let groups = groups
            .iter()
            .map(|(name, roles)| (name.clone(), roles.iter().cloned().collect()))
            .collect();
        Self { groups }
    }

    pub fn add_group<I, S>(&mut self, name: &str, roles: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .entry(name.to_string())
            .or_default()
            .extend(roles.into_iter().map(Into::into));
    }

    /// Whether `role` belongs to `group`. Unknown groups admit nobody.
    #[must_use]
    pub fn is_member(&self, role: &str, group: &str) -> bool {
        if group == GROUP_ALL {
            return true;
        }
        self.groups
            .get(group)
            .is_some_and(|roles| roles.contains(role))
    }

    #[must_use]
    pub fn allows(&self, user: &User, group: &str) -> bool {
        self.is_member(&user.role, group)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> GroupManager {
        let mut groups = HashMap::new();
        groups.insert("support_team".to_string(), vec!["support".to_string()]);
        groups.insert(
            "admins".to_string(),
            vec!["admin".to_string(), "owner".to_string()],
        );
        GroupManager::new(&groups)
    }

    #[test]
    fn support_role_scenario() {
        let groups = manager();
        assert!(groups.is_member("support", "support_team"));
        assert!(!groups.is_member("support", "admins"));
        assert!(groups.is_member("support", GROUP_ALL));
    }

    #[test]
    fn unknown_group_admits_nobody() {
        let groups = manager();
        assert!(!groups.is_member("admin", "billing"));
    }

    #[test]
    fn add_group_extends_existing_roles() {
        let mut groups = manager();
        groups.add_group("admins", ["auditor"]);
        assert!(groups.is_member("auditor", "admins"));
        assert!(groups.is_member("owner", "admins"));
        assert_eq!(groups.group_names().count(), 2);
    }
}
