//! The namespace: an arena of nodes plus server-wide administrative state.
//!
//! Nodes are keyed by their qid path. A node that leaves its directory keeps
//! its path while fids still reference it; the path returns to the allocator
//! only when the last reference goes away, so a client can never see a live
//! node under a path it cached for a removed one.

use std::collections::HashMap;
use std::sync::{Arc, atomic::AtomicBool};

use crate::{
    error::Error,
    fcall::dm,
    node::{Node, NodeId},
    path::PathAllocator,
    perm::{Class, Perm},
    synthetic::{CtlFile, GroupFile},
    users::{self, Users},
    utils::Result,
};

pub const ROOT: NodeId = 0;

/// Server-wide state edited through the synthetic files.
#[derive(Debug)]
pub struct Admin {
    pub users: Users,
    /// Log every message at info level.
    pub chatty: Arc<AtomicBool>,
    pub hostowner: String,
}

impl Admin {
    pub fn new(hostowner: &str) -> Admin {
        Admin {
            users: Users::new(hostowner),
            chatty: Arc::new(AtomicBool::new(false)),
            hostowner: hostowner.to_owned(),
        }
    }
}

#[derive(Debug)]
pub struct Tree {
    nodes: HashMap<NodeId, Node>,
    paths: PathAllocator,
}

impl Tree {
    /// A tree holding only `root`, with paths allocated from `first`.
    fn with_root(mut root: Node, first: u64) -> Tree {
        root.path = ROOT;
        root.parent = ROOT;

        let mut nodes = HashMap::new();
        nodes.insert(ROOT, root);
        Tree {
            nodes,
            paths: PathAllocator::starting_at(first),
        }
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(Error::NotFound)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(Error::NotFound)
    }

    pub fn paths(&self) -> &PathAllocator {
        &self.paths
    }

    /// Paths of every node reachable from the root.
    pub fn live_paths(&self) -> Vec<u64> {
        let mut live = Vec::new();
        let mut todo = vec![ROOT];
        while let Some(id) = todo.pop() {
            live.push(id);
            if let Some(children) = self.nodes.get(&id).and_then(Node::children) {
                todo.extend(children.values().copied());
            }
        }
        live.sort_unstable();
        live
    }

    /// Resolve `name` in directory `dir`. `..` names the parent.
    pub fn lookup(&self, dir: NodeId, name: &str) -> Result<NodeId> {
        let node = self.get(dir)?;
        let children = node.children().ok_or(Error::NotADirectory)?;
        if name == ".." {
            return Ok(node.parent);
        }
        children.get(name).copied().ok_or(Error::NotFound)
    }

    /// Link a new node into directory `dir`, giving it a fresh path.
    pub fn insert(&mut self, dir: NodeId, mut node: Node) -> Result<NodeId> {
        let parent = self.get(dir)?;
        let children = parent.children().ok_or(Error::NotADirectory)?;
        if children.contains_key(&node.name) {
            return Err(Error::AlreadyExists);
        }

        let path = self.paths.alloc()?;
        node.path = path;
        node.parent = dir;
        let name = node.name.clone();
        self.nodes.insert(path, node);

        if let Some(children) = self.get_mut(dir)?.children_mut() {
            children.insert(name, path);
        }
        Ok(path)
    }

    /// Take a node out of its directory. Its path is reclaimed once no fid
    /// references it.
    pub fn unlink(&mut self, id: NodeId) -> Result<()> {
        if id == ROOT {
            return Err(Error::PermissionDenied);
        }
        let node = self.get(id)?;
        if node.unlinked {
            return Err(Error::NotFound);
        }
        if node.children().is_some_and(|c| !c.is_empty()) {
            return Err(Error::DirectoryNotEmpty);
        }

        let (parent, name) = (node.parent, node.name.clone());
        if let Some(children) = self.get_mut(parent)?.children_mut() {
            children.remove(&name);
        }

        let node = self.get_mut(id)?;
        node.unlinked = true;
        if node.refs == 0 {
            self.reclaim(id);
        }
        Ok(())
    }

    /// Give `id` a new name within its directory.
    pub fn rename(&mut self, id: NodeId, name: &str) -> Result<()> {
        let node = self.get(id)?;
        if node.name == name {
            return Ok(());
        }
        if id == ROOT || node.unlinked {
            return Err(Error::PermissionDenied);
        }

        let (parent, old) = (node.parent, node.name.clone());
        let children = self
            .get_mut(parent)?
            .children_mut()
            .ok_or(Error::NotADirectory)?;
        if children.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        children.remove(&old);
        children.insert(name.to_owned(), id);
        self.get_mut(id)?.name = name.to_owned();
        Ok(())
    }

    pub fn incref(&mut self, id: NodeId) -> Result<()> {
        self.get_mut(id)?.refs += 1;
        Ok(())
    }

    pub fn decref(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.refs = node.refs.saturating_sub(1);
            if node.refs == 0 && node.unlinked {
                self.reclaim(id);
            }
        }
    }

    fn reclaim(&mut self, id: NodeId) {
        if self.nodes.remove(&id).is_some() {
            self.paths.release(id);
        }
    }
}

// Paths 1, 2 and 3 in this order.
fn layout(tree: &mut Tree) -> Result<()> {
    let adm = users::ADM;
    let dir = tree.insert(ROOT, Node::new("adm", adm, adm, Perm(dm::DIR | 0o770)))?;
    tree.insert(
        dir,
        Node::synthetic("group", adm, adm, Perm(0o660), Box::new(GroupFile)),
    )?;
    tree.insert(
        dir,
        Node::synthetic("ctl", adm, adm, Perm(0o220), Box::new(CtlFile)),
    )?;
    Ok(())
}

/// The tree together with the administrative state its synthetic files
/// expose. Owned by the dispatcher.
#[derive(Debug)]
pub struct Namespace {
    pub tree: Tree,
    pub admin: Admin,
}

impl Namespace {
    /// The startup namespace: the root owned by `hostowner`, the `/adm`
    /// directory with the identity table and the control file.
    ///
    /// An empty host owner is replaced by `adm`.
    pub fn new(hostowner: &str) -> Namespace {
        let hostowner = if hostowner.is_empty() {
            users::ADM
        } else {
            hostowner
        };
        let root = Node::new("/", hostowner, users::ADM, Perm(dm::DIR | 0o755));
        let mut tree = Tree::with_root(root, 1);

        // A fresh tree cannot refuse these.
        let _ = layout(&mut tree);

        Namespace {
            tree,
            admin: Admin::new(hostowner),
        }
    }

    pub fn hostowner(&self) -> &str {
        &self.admin.hostowner
    }

    /// The triad `uid` is judged by on `node`.
    pub fn class(&self, node: &Node, uid: &str) -> Class {
        if node.uid == uid {
            Class::Owner
        } else if self.admin.users.is_member(&node.gid, uid) {
            Class::Group
        } else {
            Class::Other
        }
    }

    pub fn may(&self, node: &Node, uid: &str, want: u32) -> bool {
        node.perm.allows(self.class(node, uid), want)
    }

    /// Fail with `PermissionDenied` unless `uid` holds `want` on `id`.
    pub fn check(&self, id: NodeId, uid: &str, want: u32) -> Result<()> {
        if self.may(self.tree.get(id)?, uid, want) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> Node {
        Node::new(name, "glenda", "glenda", Perm(0o644))
    }

    #[test]
    fn startup_layout() {
        let ns = Namespace::new("glenda");
        let t = &ns.tree;

        let root = t.get(ROOT).unwrap();
        assert_eq!(root.perm.to_string(), "d-rwxr-xr-x");
        assert_eq!((root.uid.as_str(), root.gid.as_str()), ("glenda", "adm"));
        assert_eq!(root.parent, ROOT);

        let adm = t.lookup(ROOT, "adm").unwrap();
        let group = t.lookup(adm, "group").unwrap();
        let ctl = t.lookup(adm, "ctl").unwrap();
        assert_eq!((adm, group, ctl), (1, 2, 3));
        assert_eq!(t.get(adm).unwrap().perm.to_string(), "d-rwxrwx---");
        assert_eq!(t.get(group).unwrap().perm.to_string(), "--rw-rw----");
        assert_eq!(t.get(ctl).unwrap().perm.to_string(), "---w--w----");
        assert_eq!(t.lookup(adm, "..").unwrap(), ROOT);
        assert_eq!(t.lookup(ROOT, "..").unwrap(), ROOT);

        assert_eq!(Namespace::new("").hostowner(), "adm");
    }

    #[test]
    fn lookup_errors() {
        let ns = Namespace::new("glenda");
        assert!(matches!(ns.tree.lookup(ROOT, "nope"), Err(Error::NotFound)));
        assert!(matches!(ns.tree.lookup(2, "x"), Err(Error::NotADirectory)));
    }

    #[test]
    fn live_paths_and_reclaim_set_stay_disjoint() {
        let mut ns = Namespace::new("glenda");
        let t = &mut ns.tree;

        let mut made = Vec::new();
        for round in 0..5 {
            for i in 0..4 {
                made.push(t.insert(ROOT, file(&format!("f{}-{}", round, i))).unwrap());
            }
            for id in made.drain(..).step_by(2) {
                t.unlink(id).unwrap();
            }
            let live = t.live_paths();
            for id in t.paths().reclaimed() {
                assert!(!live.contains(&id));
            }
        }
    }

    #[test]
    fn referenced_nodes_keep_their_path() {
        let mut ns = Namespace::new("glenda");
        let t = &mut ns.tree;

        let a = t.insert(ROOT, file("a")).unwrap();
        t.incref(a).unwrap();
        t.unlink(a).unwrap();
        assert!(!t.paths().is_reclaimed(a));
        assert!(matches!(t.lookup(ROOT, "a"), Err(Error::NotFound)));

        let b = t.insert(ROOT, file("b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(t.get(a).unwrap().name, "a");

        t.decref(a);
        assert!(t.paths().is_reclaimed(a));
        assert!(t.get(a).is_err());
        assert_eq!(t.insert(ROOT, file("c")).unwrap(), a);
    }

    #[test]
    fn unlink_rules() {
        let mut ns = Namespace::new("glenda");
        let t = &mut ns.tree;

        assert!(matches!(t.unlink(ROOT), Err(Error::PermissionDenied)));
        let d = t
            .insert(ROOT, Node::new("d", "glenda", "glenda", Perm(dm::DIR | 0o755)))
            .unwrap();
        let f = t.insert(d, file("f")).unwrap();
        assert!(matches!(t.unlink(d), Err(Error::DirectoryNotEmpty)));
        assert_eq!(t.lookup(d, "f").unwrap(), f);

        t.unlink(f).unwrap();
        t.unlink(d).unwrap();
        assert!(matches!(t.insert(ROOT, file("adm")), Err(Error::AlreadyExists)));
    }

    #[test]
    fn rename_within_directory() {
        let mut ns = Namespace::new("glenda");
        let t = &mut ns.tree;
        let a = t.insert(ROOT, file("a")).unwrap();
        t.insert(ROOT, file("b")).unwrap();

        assert!(matches!(t.rename(a, "b"), Err(Error::AlreadyExists)));
        t.rename(a, "c").unwrap();
        assert_eq!(t.lookup(ROOT, "c").unwrap(), a);
        assert!(t.lookup(ROOT, "a").is_err());
    }

    #[test]
    fn permission_classes() {
        let mut ns = Namespace::new("glenda");
        ns.admin.users.merge("alice::\nbob::\n").unwrap();

        // /adm is adm:adm 0770, glenda is a member of adm
        assert!(ns.check(1, "glenda", dm::EXEC).is_ok());
        assert!(matches!(
            ns.check(1, "alice", dm::EXEC),
            Err(Error::PermissionDenied)
        ));
        assert!(ns.check(ROOT, "bob", dm::READ | dm::EXEC).is_ok());
        assert!(ns.check(ROOT, "bob", dm::WRITE).is_err());
        assert!(ns.check(ROOT, "glenda", dm::WRITE).is_ok());
    }
}
