//! Identity store.
//!
//! Every identity doubles as a group of the same name. Group membership is
//! the identity itself, its leader and its member list. Unknown names resolve
//! to the anonymous identity instead of failing.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::{error::Error, utils::Result};

/// The anonymous identity.
pub const NONE: &str = "none";

/// The administrative identity owning `/adm`.
pub const ADM: &str = "adm";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub leader: Option<String>,
    pub members: Vec<String>,
}

impl User {
    pub fn new(name: &str) -> User {
        User {
            name: name.to_owned(),
            leader: None,
            members: Vec::new(),
        }
    }

    /// Render as a `name:leader:member,member` table line.
    pub fn line(&self) -> String {
        format!(
            "{}:{}:{}",
            self.name,
            self.leader.as_deref().unwrap_or(""),
            self.members.join(",")
        )
    }

    fn parse(line: &str) -> Result<User> {
        let mut fields = line.split(':');
        let (name, leader, members) = match (fields.next(), fields.next(), fields.next()) {
            (Some(name), Some(leader), Some(members)) if fields.next().is_none() => {
                (name.trim(), leader.trim(), members.trim())
            }
            _ => return Err(Error::invalid(format!("bad users line: {}", line))),
        };
        if !valid_name(name) {
            return Err(Error::invalid(format!("bad user name: {}", name)));
        }

        let members = members
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(User {
            name: name.to_owned(),
            leader: (!leader.is_empty()).then(|| leader.to_owned()),
            members,
        })
    }
}

/// Longest file or user name, in bytes.
pub const MAXNAME: usize = 255;

pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAXNAME
        && name != "."
        && name != ".."
        && !name.contains(|c: char| c == ':' || c == ',' || c == '/' || c.is_whitespace())
}

#[derive(Clone, Debug)]
pub struct Users {
    table: BTreeMap<String, User>,
}

impl Users {
    /// The initial table: `adm` with the host owner as its member, the
    /// anonymous `none` and the host owner itself.
    pub fn new(hostowner: &str) -> Users {
        let mut adm = User::new(ADM);
        if hostowner != ADM {
            adm.members.push(hostowner.to_owned());
        }

        let mut users = Users {
            table: BTreeMap::new(),
        };
        users.insert(adm);
        users.insert(User::new(NONE));
        if !users.contains(hostowner) {
            users.insert(User::new(hostowner));
        }
        users
    }

    pub fn get(&self, name: &str) -> Option<&User> {
        self.table.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Look up `name`, falling back to the anonymous identity.
    pub fn resolve(&self, name: &str) -> &str {
        match self.table.get_key_value(name) {
            Some((name, _)) => name,
            None => NONE,
        }
    }

    pub fn insert(&mut self, user: User) {
        self.table.insert(user.name.clone(), user);
    }

    pub fn remove(&mut self, name: &str) -> Option<User> {
        self.table.remove(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut User> {
        self.table.get_mut(name)
    }

    /// Drop `name` from every leadership and member list.
    pub fn forget(&mut self, name: &str) {
        for user in self.table.values_mut() {
            if user.leader.as_deref() == Some(name) {
                user.leader = None;
            }
            user.members.retain(|m| m != name);
        }
    }

    /// Whether `uid` belongs to group `gid`.
    pub fn is_member(&self, gid: &str, uid: &str) -> bool {
        if gid == uid {
            return true;
        }
        match self.table.get(gid) {
            Some(group) => {
                group.leader.as_deref() == Some(uid) || group.members.iter().any(|m| m == uid)
            }
            None => false,
        }
    }

    /// Whether `uid` leads group `gid`. A group without a leader is led by
    /// all of its members.
    pub fn is_leader(&self, gid: &str, uid: &str) -> bool {
        match self.table.get(gid) {
            Some(group) => match group.leader.as_deref() {
                Some(leader) => leader == uid,
                None => self.is_member(gid, uid),
            },
            None => false,
        }
    }

    /// Render the whole table, one identity per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for user in self.table.values() {
            let _ = writeln!(out, "{}", user.line());
        }
        out
    }

    /// Merge table lines into the store, replacing identities of the same
    /// name. Either every line is applied or none is.
    pub fn merge(&mut self, text: &str) -> Result<usize> {
        let parsed = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(User::parse)
            .collect::<Result<Vec<_>>>()?;

        let n = parsed.len();
        for user in parsed {
            self.insert(user);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_table() {
        let users = Users::new("glenda");
        assert_eq!(users.render(), "adm::glenda\nglenda::\nnone::\n");
        assert!(users.is_member(ADM, "glenda"));
        assert!(!users.is_member(ADM, NONE));
    }

    #[test]
    fn names_are_bounded() {
        assert!(valid_name(&"n".repeat(MAXNAME)));
        assert!(!valid_name(&"n".repeat(MAXNAME + 1)));
        assert!(!valid_name("a b"));
        assert!(!valid_name(".."));
    }

    #[test]
    fn hostowner_adm_is_not_its_own_member() {
        let users = Users::new(ADM);
        assert_eq!(users.render(), "adm::\nnone::\n");
    }

    #[test]
    fn unknown_names_fall_back_to_none() {
        let users = Users::new("glenda");
        assert_eq!(users.resolve("glenda"), "glenda");
        assert_eq!(users.resolve("alice"), NONE);
        assert_eq!(users.resolve(""), NONE);
    }

    #[test]
    fn merge_replaces_and_adds() {
        let mut users = Users::new("glenda");
        let n = users
            .merge("# staff\nsys:glenda:glenda,alice\nalice::\n")
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(users.resolve("alice"), "alice");
        assert!(users.is_member("sys", "alice"));
        assert!(users.is_leader("sys", "glenda"));
        assert!(!users.is_leader("sys", "alice"));
    }

    #[test]
    fn merge_is_all_or_nothing() {
        let mut users = Users::new("glenda");
        let before = users.render();
        assert!(users.merge("bob::\nbroken line\n").is_err());
        assert!(users.merge("a/b::\n").is_err());
        assert_eq!(users.render(), before);
    }

    #[test]
    fn leaderless_group_is_led_by_members() {
        let mut users = Users::new("glenda");
        assert!(users.is_leader(ADM, "glenda"));
        users.get_mut(ADM).unwrap().leader = Some(ADM.to_owned());
        assert!(!users.is_leader(ADM, "glenda"));
    }
}
