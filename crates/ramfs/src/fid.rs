//! Client handles into the namespace.
//!
//! An `FId` is bound to one node and, once opened, to one open mode. Every
//! operation takes the namespace explicitly; only the dispatcher holds it, so
//! operations never interleave.

use std::ops::Bound;

use crate::{
    error::Error,
    fcall::{IOUNIT, MAXWELEM, QId, Stat, dm, om},
    io_err,
    node::{Content, Node, NodeId},
    perm::Perm,
    serialize,
    tree::{Namespace, ROOT},
    users,
    utils::{self, Result},
};

/// Position of a directory read: the byte offset handed out so far and the
/// name of the last entry returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirCursor {
    pub offset: u64,
    pub last: Option<String>,
}

#[derive(Debug)]
pub struct FId {
    /// Raw client side fid.
    pub num: u32,
    uid: String,
    node: NodeId,
    mode: Option<u8>,
    cursor: DirCursor,
    bound: bool,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// Permission bits an open in `mode` needs.
fn wanted(mode: u8) -> u32 {
    let want = match mode & 3 {
        om::READ => dm::READ,
        om::WRITE => dm::WRITE,
        om::RDWR => dm::READ | dm::WRITE,
        _ => dm::EXEC,
    };
    if mode & om::TRUNC != 0 {
        want | dm::WRITE
    } else {
        want
    }
}

fn readable(mode: u8) -> bool {
    matches!(mode & 3, om::READ | om::RDWR | om::EXEC)
}

fn writable(mode: u8) -> bool {
    matches!(mode & 3, om::WRITE | om::RDWR)
}

impl FId {
    /// An unbound fid owned by the anonymous identity.
    pub fn template() -> FId {
        FId {
            num: 0,
            uid: users::NONE.to_owned(),
            node: ROOT,
            mode: None,
            cursor: DirCursor::default(),
            bound: false,
        }
    }

    pub fn numbered(mut self, num: u32) -> FId {
        self.num = num;
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.mode.is_some()
    }

    fn bind(&mut self, ns: &mut Namespace, uid: &str, node: NodeId) -> Result<()> {
        ns.tree.incref(node)?;
        if self.bound {
            ns.tree.decref(self.node);
        }
        self.uid = uid.to_owned();
        self.node = node;
        self.bound = true;
        Ok(())
    }

    /// Step from directory `dir` to `name`, checking traversal permission.
    fn step(ns: &Namespace, uid: &str, dir: NodeId, name: &str) -> Result<NodeId> {
        let node = ns.tree.get(dir)?;
        if !node.is_dir() {
            return Err(Error::NotADirectory);
        }
        if !ns.may(node, uid, dm::EXEC) {
            return Err(Error::PermissionDenied);
        }
        ns.tree.lookup(dir, name)
    }

    /// Bind this fid to the root of the tree named by `aname` as `uname`.
    ///
    /// Unknown users are attached as the anonymous identity.
    pub fn attach(&mut self, ns: &mut Namespace, uname: &str, aname: &str) -> Result<QId> {
        let uid = ns.admin.users.resolve(uname).to_owned();

        let mut node = ROOT;
        for name in utils::split_path(aname) {
            node = Self::step(ns, &uid, node, name)?;
        }

        self.bind(ns, &uid, node)?;
        self.mode = None;
        Ok(ns.tree.get(node)?.qid())
    }

    /// Walk `names` from this fid.
    ///
    /// Returns the qids of the names that resolved. When all of them did, the
    /// walked fid is returned too, built from `newfid`; otherwise nothing is
    /// bound. A failure on the first name is reported as an error.
    pub fn walk(
        &self,
        ns: &mut Namespace,
        names: &[String],
        mut newfid: FId,
    ) -> Result<(Vec<QId>, Option<FId>)> {
        if self.is_open() {
            return Err(Error::BadUseOfFid);
        }
        if names.len() > MAXWELEM {
            return Err(Error::invalid("too many names in walk"));
        }

        let mut node = self.node;
        let mut wqids = Vec::with_capacity(names.len());
        for name in names {
            match Self::step(ns, &self.uid, node, name) {
                Ok(next) => {
                    node = next;
                    wqids.push(ns.tree.get(node)?.qid());
                }
                Err(e) if wqids.is_empty() => return Err(e),
                Err(_) => return Ok((wqids, None)),
            }
        }

        newfid.bind(ns, &self.uid, node)?;
        Ok((wqids, Some(newfid)))
    }

    /// Open the bound node in `mode`.
    pub fn open(&mut self, ns: &mut Namespace, mode: u8) -> Result<(QId, u32)> {
        if self.is_open() {
            return Err(Error::BadUseOfFid);
        }

        let node = ns.tree.get(self.node)?;
        let want = wanted(mode);
        if node.is_dir() && want & dm::WRITE != 0 {
            return Err(Error::IsADirectory);
        }
        if !ns.may(node, &self.uid, want) {
            return Err(Error::PermissionDenied);
        }
        if mode & om::RCLOSE != 0 {
            ns.check(node.parent, &self.uid, dm::WRITE)?;
        }
        if node.perm.is_excl() && node.openers > 0 {
            return Err(Error::Busy);
        }

        let node = ns.tree.get_mut(self.node)?;
        if mode & om::TRUNC != 0 {
            if let Content::File(ref mut blocks) = node.content {
                blocks.resize(0);
                node.touch(&self.uid);
            }
        }
        node.openers += 1;
        self.mode = Some(mode);
        self.cursor = DirCursor::default();
        Ok((node.qid(), IOUNIT))
    }

    /// Create `name` in the bound directory and open it in `mode`.
    ///
    /// The new node belongs to the requester and inherits the directory's
    /// group; its permissions are limited by those of the directory.
    pub fn create(
        &mut self,
        ns: &mut Namespace,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(QId, u32)> {
        if self.is_open() {
            return Err(Error::BadUseOfFid);
        }

        let dir = ns.tree.get(self.node)?;
        if !dir.is_dir() {
            return Err(Error::NotADirectory);
        }
        if !ns.may(dir, &self.uid, dm::WRITE) {
            return Err(Error::PermissionDenied);
        }
        if !valid_name(name) {
            return Err(Error::invalid(format!("bad file name: {}", name)));
        }
        if dir.children().is_some_and(|c| c.contains_key(name)) {
            return Err(Error::AlreadyExists);
        }

        let dirperm = dir.perm.bits();
        let bits = if perm & dm::DIR != 0 {
            if wanted(mode) & dm::WRITE != 0 {
                return Err(Error::IsADirectory);
            }
            perm & (!0o777 | (dirperm & 0o777))
        } else {
            perm & (!0o666 | (dirperm & 0o666))
        };

        let node = Node::new(name, &self.uid, &dir.gid, Perm(bits));
        let id = ns.tree.insert(self.node, node)?;
        let uid = self.uid.clone();
        self.bind(ns, &uid, id)?;

        let node = ns.tree.get_mut(id)?;
        node.openers += 1;
        self.mode = Some(mode);
        self.cursor = DirCursor::default();
        Ok((node.qid(), IOUNIT))
    }

    /// Read at most `count` bytes at `offset`.
    pub fn read(&mut self, ns: &mut Namespace, offset: u64, count: u32) -> Result<Vec<u8>> {
        match self.mode {
            Some(mode) if readable(mode) => {}
            _ => return Err(Error::BadUseOfFid),
        }
        let count = count.min(IOUNIT) as usize;

        let Namespace { tree, admin } = ns;
        let node = tree.get(self.node)?;
        let data = match node.content {
            Content::Dir(ref children) => {
                if offset == 0 {
                    self.cursor = DirCursor::default();
                } else if offset != self.cursor.offset {
                    return Err(Error::BadOffset);
                }

                let start = match self.cursor.last {
                    Some(ref last) => Bound::Excluded(last.as_str()),
                    None => Bound::Unbounded,
                };
                let mut out = Vec::new();
                for (name, &child) in children.range::<str, _>((start, Bound::Unbounded)) {
                    let entry = serialize::stat_bytes(&tree.get(child)?.stat())?;
                    if out.len() + entry.len() > count {
                        if out.is_empty() {
                            return Err(From::from(io_err!(
                                InvalidInput,
                                "read count too small for directory entry"
                            )));
                        }
                        break;
                    }
                    out.extend_from_slice(&entry);
                    self.cursor.last = Some(name.clone());
                }
                self.cursor.offset += out.len() as u64;
                out
            }
            Content::File(ref blocks) => blocks.read(offset, count),
            Content::Synthetic(ref s) => {
                let text = s.read(admin)?;
                let start = (offset as usize).min(text.len());
                let end = start.saturating_add(count).min(text.len());
                text[start..end].to_vec()
            }
        };

        if let Ok(node) = tree.get_mut(self.node) {
            node.atime = crate::node::now();
        }
        Ok(data)
    }

    /// Write `data` at `offset`. Append-only files ignore the offset.
    pub fn write(&mut self, ns: &mut Namespace, offset: u64, data: &[u8]) -> Result<u32> {
        match self.mode {
            Some(mode) if writable(mode) => {}
            _ => return Err(Error::BadUseOfFid),
        }
        let data = &data[..data.len().min(IOUNIT as usize)];

        let Namespace { tree, admin } = ns;
        let node = tree.get_mut(self.node)?;
        let n = match node.content {
            Content::Dir(_) => return Err(Error::IsADirectory),
            Content::File(ref mut blocks) => {
                let offset = if node.perm.is_append() {
                    blocks.len()
                } else {
                    offset
                };
                blocks.write(offset, data)?
            }
            Content::Synthetic(ref s) => s.write(admin, data)?,
        };
        node.touch(&self.uid);
        Ok(n as u32)
    }

    /// Release the node. A fid opened with `ORCLOSE` removes its file.
    pub fn clunk(mut self, ns: &mut Namespace) {
        if self.mode.is_some_and(|m| m & om::RCLOSE != 0) {
            let _ = self.unlink(ns);
        }
        self.release(ns);
    }

    /// Remove the bound node. The fid is clunked whether or not removal
    /// succeeds.
    pub fn remove(mut self, ns: &mut Namespace) -> Result<()> {
        let res = self.unlink(ns);
        self.release(ns);
        res
    }

    fn unlink(&mut self, ns: &mut Namespace) -> Result<()> {
        if let Some(mode) = self.mode.as_mut() {
            *mode &= !om::RCLOSE;
        }
        let node = ns.tree.get(self.node)?;
        if self.node == ROOT {
            return Err(Error::PermissionDenied);
        }
        ns.check(node.parent, &self.uid, dm::WRITE)?;
        ns.tree.unlink(self.node)
    }

    fn release(&mut self, ns: &mut Namespace) {
        if !self.bound {
            return;
        }
        if self.mode.take().is_some() {
            if let Ok(node) = ns.tree.get_mut(self.node) {
                node.openers = node.openers.saturating_sub(1);
            }
        }
        ns.tree.decref(self.node);
        self.bound = false;
    }

    pub fn stat(&self, ns: &Namespace) -> Result<Stat> {
        Ok(ns.tree.get(self.node)?.stat())
    }

    /// Apply the fields of `stat` that are not "don't touch" values.
    ///
    /// Every change is checked before any is made.
    pub fn wstat(&mut self, ns: &mut Namespace, stat: &Stat) -> Result<()> {
        let node = ns.tree.get(self.node)?;
        let uid = self.uid.as_str();
        let users = &ns.admin.users;
        let owner = node.uid == uid;
        let leader = users.is_leader(&node.gid, uid);

        let rename = !stat.name.is_empty() && stat.name != node.name;
        if rename {
            if !valid_name(&stat.name) {
                return Err(Error::invalid(format!("bad file name: {}", stat.name)));
            }
            if self.node == ROOT || node.unlinked {
                return Err(Error::PermissionDenied);
            }
            ns.check(node.parent, uid, dm::WRITE)?;
            if ns.tree.lookup(node.parent, &stat.name).is_ok() {
                return Err(Error::AlreadyExists);
            }
        }

        let resize = stat.length != !0 && stat.length != node.length();
        if resize {
            match node.content {
                Content::Dir(_) => return Err(Error::IsADirectory),
                Content::Synthetic(_) => return Err(Error::PermissionDenied),
                Content::File(_) => {}
            }
            if !ns.may(node, uid, dm::WRITE) {
                return Err(Error::PermissionDenied);
            }
            // files only grow by writing
            if stat.length > node.length() {
                return Err(Error::BadOffset);
            }
        }

        let chmod = stat.mode != !0 && stat.mode != node.perm.bits();
        if chmod {
            if !owner && !leader {
                return Err(Error::PermissionDenied);
            }
            if (stat.mode ^ node.perm.bits()) & dm::DIR != 0 {
                return Err(Error::invalid("can't change directory bit"));
            }
        }

        let touch = stat.mtime != !0 && stat.mtime != node.mtime;
        if touch && !owner && !leader {
            return Err(Error::PermissionDenied);
        }

        let chgrp = !stat.gid.is_empty() && stat.gid != node.gid;
        if chgrp {
            if !users.contains(&stat.gid) {
                return Err(Error::invalid(format!("unknown group: {}", stat.gid)));
            }
            if !(owner && users.is_member(&stat.gid, uid)) && !leader {
                return Err(Error::PermissionDenied);
            }
        }

        if !stat.uid.is_empty() && stat.uid != node.uid {
            return Err(Error::PermissionDenied);
        }

        if rename {
            ns.tree.rename(self.node, &stat.name)?;
        }
        let uid = self.uid.clone();
        let node = ns.tree.get_mut(self.node)?;
        if resize {
            if let Content::File(ref mut blocks) = node.content {
                blocks.resize(stat.length);
            }
            node.touch(&uid);
        }
        if chmod {
            node.perm = Perm(stat.mode);
        }
        if touch {
            node.mtime = stat.mtime;
        }
        if chgrp {
            node.gid = stat.gid.clone();
        }
        Ok(())
    }
}
