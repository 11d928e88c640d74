use std::collections::BTreeMap;

use crate::signaling::Role;

/// One remote member of the space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub role: Role,
}

/// Remote members, keyed by id. Only `user-joined`/`user-left` change it.
#[derive(Debug, Default)]
pub(crate) struct Roster {
    members: BTreeMap<String, Role>,
}

impl Roster {
    /// Returns `true` if the roster changed.
    pub fn join(&mut self, user_id: &str, role: Role) -> bool {
        self.members.insert(user_id.to_owned(), role) != Some(role)
    }

    /// Returns `true` if the roster changed.
    pub fn leave(&mut self, user_id: &str) -> bool {
        self.members.remove(user_id).is_some()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.members.is_empty();
        self.members.clear();
        changed
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.members
            .iter()
            .map(|(user_id, role)| Participant { user_id: user_id.clone(), role: *role })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave_report_changes() {
        let mut roster = Roster::default();
        assert!(roster.join("bob", Role::Speaker));
        assert!(!roster.join("bob", Role::Speaker));
        assert!(roster.join("bob", Role::CoHost));
        assert!(roster.leave("bob"));
        assert!(!roster.leave("bob"));
        assert!(!roster.clear());
    }

    #[test]
    fn participants_are_sorted_by_id() {
        let mut roster = Roster::default();
        roster.join("carol", Role::Listener);
        roster.join("bob", Role::Host);
        let ids: Vec<_> = roster.participants().into_iter().map(|p| p.user_id).collect();
        assert_eq!(ids, ["bob", "carol"]);
    }
}
