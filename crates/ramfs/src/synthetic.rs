//! Files whose content is produced on demand.
//!
//! A synthetic node keeps no bytes of its own. Reads render a textual view of
//! administrative state and writes are interpreted as edits of that state.

use std::fmt;
use std::sync::atomic::Ordering;

use log::info;

use crate::{
    error::Error,
    tree::Admin,
    users::{self, User, Users},
    utils::Result,
};

pub trait Synthetic: Send + fmt::Debug {
    /// Render the whole content.
    fn read(&self, admin: &Admin) -> Result<Vec<u8>>;

    /// Consume `data`, returning the number of bytes accepted.
    fn write(&self, admin: &mut Admin, data: &[u8]) -> Result<usize>;
}

fn text(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data).map_err(|_| Error::invalid("text is not utf-8"))
}

/// `/adm/group`: the identity table.
#[derive(Debug)]
pub struct GroupFile;

impl Synthetic for GroupFile {
    fn read(&self, admin: &Admin) -> Result<Vec<u8>> {
        Ok(admin.users.render().into_bytes())
    }

    fn write(&self, admin: &mut Admin, data: &[u8]) -> Result<usize> {
        let n = admin.users.merge(text(data)?)?;
        info!("group: merged {} entries", n);
        Ok(data.len())
    }
}

/// `/adm/ctl`: administrative commands, one per line.
#[derive(Debug)]
pub struct CtlFile;

impl Synthetic for CtlFile {
    fn read(&self, _: &Admin) -> Result<Vec<u8>> {
        Err(Error::PermissionDenied)
    }

    /// Every line is run against a copy of the table, which replaces the
    /// real one only if all of them succeed.
    fn write(&self, admin: &mut Admin, data: &[u8]) -> Result<usize> {
        let mut staged = Staged {
            users: admin.users.clone(),
            chatty: None,
        };
        let mut done = Vec::new();
        for line in text(data)?.lines() {
            let args: Vec<&str> = line.split_whitespace().collect();
            if !args.is_empty() {
                command(&mut staged, &admin.hostowner, &args)?;
                done.push(line.trim());
            }
        }

        admin.users = staged.users;
        if let Some(on) = staged.chatty {
            admin.chatty.store(on, Ordering::Relaxed);
        }
        for line in done {
            info!("ctl: {}", line);
        }
        Ok(data.len())
    }
}

struct Staged {
    users: Users,
    chatty: Option<bool>,
}

fn known<'a>(users: &'a mut Users, name: &str) -> Result<&'a mut User> {
    users
        .get_mut(name)
        .ok_or_else(|| Error::invalid(format!("unknown user: {}", name)))
}

fn command(staged: &mut Staged, hostowner: &str, args: &[&str]) -> Result<()> {
    let users = &mut staged.users;
    match *args {
        ["uname", name] => {
            if !users::valid_name(name) {
                return Err(Error::invalid(format!("bad user name: {}", name)));
            }
            if users.contains(name) {
                return Err(Error::AlreadyExists);
            }
            users.insert(User::new(name));
        }
        ["uname", name, edit] => {
            let (op, arg) = edit.split_at(edit.chars().next().map_or(0, char::len_utf8));
            if !arg.is_empty() && !users.contains(arg) {
                return Err(Error::invalid(format!("unknown user: {}", arg)));
            }
            let user = known(users, name)?;
            match op {
                "=" => user.leader = (!arg.is_empty()).then(|| arg.to_owned()),
                "+" if !arg.is_empty() => {
                    if !user.members.iter().any(|m| m == arg) {
                        user.members.push(arg.to_owned());
                    }
                }
                "-" if !arg.is_empty() => user.members.retain(|m| m != arg),
                _ => return Err(Error::invalid(format!("bad uname edit: {}", edit))),
            }
        }
        ["unuser", name] => {
            if name == users::NONE || name == users::ADM || name == hostowner {
                return Err(Error::PermissionDenied);
            }
            users
                .remove(name)
                .ok_or_else(|| Error::invalid(format!("unknown user: {}", name)))?;
            users.forget(name);
        }
        ["chatty", "on"] => staged.chatty = Some(true),
        ["chatty", "off"] => staged.chatty = Some(false),
        _ => return Err(Error::invalid(format!("bad ctl command: {}", args.join(" ")))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Admin {
        Admin::new("glenda")
    }

    #[test]
    fn group_file_renders_and_merges() {
        let mut a = admin();
        let table = GroupFile.read(&a).unwrap();
        assert_eq!(table, b"adm::glenda\nglenda::\nnone::\n");

        assert_eq!(GroupFile.write(&mut a, b"alice::\n").unwrap(), 8);
        assert_eq!(a.users.resolve("alice"), "alice");
        assert!(GroupFile.write(&mut a, b"bad\n").is_err());
    }

    #[test]
    fn uname_edits() {
        let mut a = admin();
        CtlFile
            .write(&mut a, b"uname alice\nuname sys\nuname sys =glenda\nuname sys +alice\n")
            .unwrap();
        let sys = a.users.get("sys").unwrap();
        assert_eq!(sys.leader.as_deref(), Some("glenda"));
        assert_eq!(sys.members, vec!["alice".to_owned()]);

        CtlFile.write(&mut a, b"uname sys -alice\nuname sys =\n").unwrap();
        let sys = a.users.get("sys").unwrap();
        assert!(sys.leader.is_none());
        assert!(sys.members.is_empty());

        assert!(matches!(
            CtlFile.write(&mut a, b"uname alice"),
            Err(Error::AlreadyExists)
        ));
        assert!(CtlFile.write(&mut a, b"uname sys +bob").is_err());
        assert!(CtlFile.write(&mut a, b"uname sys *alice").is_err());
    }

    #[test]
    fn unuser_spares_builtin_identities() {
        let mut a = admin();
        for name in ["none", "adm", "glenda"] {
            let cmd = format!("unuser {}", name);
            assert!(matches!(
                CtlFile.write(&mut a, cmd.as_bytes()),
                Err(Error::PermissionDenied)
            ));
        }

        CtlFile.write(&mut a, b"uname alice\nuname adm +alice\n").unwrap();
        CtlFile.write(&mut a, b"unuser alice").unwrap();
        assert_eq!(a.users.resolve("alice"), users::NONE);
        assert!(!a.users.is_member(users::ADM, "alice"));
    }

    #[test]
    fn chatty_toggles_shared_flag() {
        let mut a = admin();
        let flag = a.chatty.clone();
        CtlFile.write(&mut a, b"chatty on\n").unwrap();
        assert!(flag.load(Ordering::Relaxed));
        CtlFile.write(&mut a, b"chatty off\n").unwrap();
        assert!(!flag.load(Ordering::Relaxed));

        assert!(matches!(
            CtlFile.write(&mut a, b"reboot"),
            Err(Error::Invalid(_))
        ));
        assert!(CtlFile.read(&a).is_err());
    }

    #[test]
    fn failed_batches_change_nothing() {
        let mut a = admin();
        let before = a.users.render();
        assert!(matches!(
            CtlFile.write(&mut a, b"uname carol\nchatty on\nuname adm +carol\nreboot\n"),
            Err(Error::Invalid(_))
        ));
        assert_eq!(a.users.render(), before);
        assert!(!a.chatty.load(Ordering::Relaxed));

        CtlFile
            .write(&mut a, b"uname carol\nchatty on\nuname adm +carol\n")
            .unwrap();
        assert!(a.users.is_member(users::ADM, "carol"));
        assert!(a.chatty.load(Ordering::Relaxed));
    }
}
