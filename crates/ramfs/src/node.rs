//! Nodes of the in-memory tree and their content.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    error::Error,
    fcall::{BLOCKSIZE, QId, Stat},
    perm::Perm,
    synthetic::Synthetic,
    utils::Result,
};

/// Key of a node in the tree arena. Equal to the node's qid path.
pub type NodeId = u64;

/// Seconds since the epoch, as carried in `Stat`.
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// File content kept in fixed size blocks.
///
/// Every block but the last one is full.
#[derive(Clone, Debug)]
pub struct Blocks {
    blocks: Vec<Vec<u8>>,
    len: u64,
    bsize: usize,
}

impl Default for Blocks {
    fn default() -> Self {
        Self::with_block_size(BLOCKSIZE)
    }
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks::default()
    }

    pub fn with_block_size(bsize: usize) -> Blocks {
        Blocks {
            blocks: Vec::new(),
            len: 0,
            bsize: bsize.max(1),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Read at most `count` bytes at `offset`. Reading at or past the end
    /// yields nothing.
    pub fn read(&self, offset: u64, count: usize) -> Vec<u8> {
        if offset >= self.len {
            return Vec::new();
        }
        let end = self.len.min(offset.saturating_add(count as u64)) as usize;
        let mut pos = offset as usize;
        let mut out = Vec::with_capacity(end - pos);

        while pos < end {
            let (b, o) = (pos / self.bsize, pos % self.bsize);
            let n = (self.bsize - o).min(end - pos);
            out.extend_from_slice(&self.blocks[b][o..o + n]);
            pos += n;
        }
        out
    }

    /// Write `data` at `offset`, growing the content as needed.
    ///
    /// Offsets beyond the current length are refused, files never have holes.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if offset > self.len {
            return Err(Error::BadOffset);
        }
        let end = offset + data.len() as u64;
        if end > self.len {
            self.resize(end);
        }

        let mut pos = offset as usize;
        let mut rest = data;
        while !rest.is_empty() {
            let (b, o) = (pos / self.bsize, pos % self.bsize);
            let n = (self.bsize - o).min(rest.len());
            self.blocks[b][o..o + n].copy_from_slice(&rest[..n]);
            pos += n;
            rest = &rest[n..];
        }
        Ok(data.len())
    }

    /// Set the length, dropping whole blocks on shrink and zero filling on
    /// growth.
    pub fn resize(&mut self, len: u64) {
        let len = len as usize;
        let cur = self.len as usize;

        if len < cur {
            let nblocks = len.div_ceil(self.bsize);
            self.blocks.truncate(nblocks);
            if let Some(last) = self.blocks.last_mut() {
                last.truncate(len - (nblocks - 1) * self.bsize);
            }
        } else {
            let mut cur = cur;
            while cur < len {
                if self.blocks.last().is_none_or(|b| b.len() == self.bsize) {
                    self.blocks.push(Vec::new());
                }
                if let Some(last) = self.blocks.last_mut() {
                    let n = (self.bsize - last.len()).min(len - cur);
                    last.resize(last.len() + n, 0);
                    cur += n;
                }
            }
        }
        self.len = len as u64;
    }
}

#[derive(Debug)]
pub enum Content {
    Dir(BTreeMap<String, NodeId>),
    File(Blocks),
    Synthetic(Box<dyn Synthetic>),
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub perm: Perm,
    pub path: u64,
    pub version: u32,
    pub atime: u32,
    pub mtime: u32,
    /// The containing directory. The root is its own parent.
    pub parent: NodeId,
    pub content: Content,
    /// Number of fids bound to this node.
    pub refs: usize,
    /// Number of fids holding this node open.
    pub openers: usize,
    /// Set once the node has left its directory.
    pub unlinked: bool,
}

impl Node {
    /// A new node owned by `uid`. Directories get an empty child map, other
    /// nodes empty block storage.
    pub fn new(name: &str, uid: &str, gid: &str, perm: Perm) -> Node {
        let content = if perm.is_dir() {
            Content::Dir(BTreeMap::new())
        } else {
            Content::File(Blocks::new())
        };
        let t = now();

        Node {
            name: name.to_owned(),
            uid: uid.to_owned(),
            gid: gid.to_owned(),
            muid: uid.to_owned(),
            perm,
            path: 0,
            version: 0,
            atime: t,
            mtime: t,
            parent: 0,
            content,
            refs: 0,
            openers: 0,
            unlinked: false,
        }
    }

    pub fn synthetic(name: &str, uid: &str, gid: &str, perm: Perm, s: Box<dyn Synthetic>) -> Node {
        Node {
            content: Content::Synthetic(s),
            ..Node::new(name, uid, gid, perm)
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.content, Content::Dir(_))
    }

    pub fn children(&self) -> Option<&BTreeMap<String, NodeId>> {
        match self.content {
            Content::Dir(ref children) => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, NodeId>> {
        match self.content {
            Content::Dir(ref mut children) => Some(children),
            _ => None,
        }
    }

    pub fn length(&self) -> u64 {
        match self.content {
            Content::File(ref blocks) => blocks.len(),
            _ => 0,
        }
    }

    pub fn qid(&self) -> QId {
        QId {
            typ: self.perm.qid_type(),
            version: self.version,
            path: self.path,
        }
    }

    pub fn stat(&self) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid(),
            mode: self.perm.bits(),
            atime: self.atime,
            mtime: self.mtime,
            length: self.length(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            muid: self.muid.clone(),
        }
    }

    /// Record a content change made by `uid`.
    pub fn touch(&mut self, uid: &str) {
        self.version = self.version.wrapping_add(1);
        self.mtime = now();
        if self.muid != uid {
            self.muid = uid.to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{QIdType, dm};

    #[test]
    fn content_grows_by_blocks() {
        let mut b = Blocks::with_block_size(4);
        assert_eq!(b.write(0, b"hello").unwrap(), 5);
        assert_eq!(b.len(), 5);
        assert_eq!(b.block_count(), 2);
        assert_eq!(b.read(0, 100), b"hello");
        assert_eq!(b.read(3, 2), b"lo");

        b.write(5, b" world").unwrap();
        assert_eq!(b.block_count(), 3);
        assert_eq!(b.read(0, 11), b"hello world");
    }

    #[test]
    fn overwrite_in_place() {
        let mut b = Blocks::with_block_size(4);
        b.write(0, b"A").unwrap();
        b.write(0, b"B").unwrap();
        assert_eq!(b.read(0, 10), b"B");
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn no_holes() {
        let mut b = Blocks::with_block_size(4);
        b.write(0, b"abc").unwrap();
        assert!(matches!(b.write(4, b"x"), Err(Error::BadOffset)));
        assert_eq!(b.write(3, b"d").unwrap(), 1);
        assert!(b.read(4, 10).is_empty());
        assert!(b.read(100, 10).is_empty());
    }

    #[test]
    fn resize_drops_and_fills() {
        let mut b = Blocks::with_block_size(4);
        b.write(0, b"0123456789").unwrap();
        b.resize(5);
        assert_eq!(b.block_count(), 2);
        assert_eq!(b.read(0, 100), b"01234");

        b.resize(9);
        assert_eq!(b.read(0, 100), b"01234\0\0\0\0");
        assert_eq!(b.block_count(), 3);

        b.resize(0);
        assert!(b.is_empty());
        assert_eq!(b.block_count(), 0);
    }

    #[test]
    fn stat_reflects_node() {
        let mut n = Node::new("x", "glenda", "adm", Perm(dm::APPEND | 0o644));
        n.path = 7;
        if let Content::File(ref mut b) = n.content {
            b.write(0, b"data").unwrap();
        }
        n.touch("alice");

        let st = n.stat();
        assert_eq!(st.qid.path, 7);
        assert_eq!(st.qid.version, 1);
        assert_eq!(st.qid.typ, QIdType::APPEND);
        assert_eq!(st.length, 4);
        assert_eq!(st.muid, "alice");
        assert_eq!(st.mode, dm::APPEND | 0o644);

        let d = Node::new("d", "glenda", "adm", Perm(dm::DIR | 0o755));
        assert!(d.is_dir());
        assert_eq!(d.stat().length, 0);
    }
}
