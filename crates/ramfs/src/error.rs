//! 9P2000 error representations.
//!
//! In 9P2000 errors travel as strings in `RError`. The `Display` text of every
//! variant is exactly the ename sent to the client, following the wording of
//! the Plan 9 kernel where one exists.

use std::io;

/// Longest ename sent to a client, in bytes.
pub const ERRMAX: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file does not exist")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file already exists")]
    AlreadyExists,
    #[error("permission denied")]
    PermissionDenied,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("bad offset")]
    BadOffset,
    /// The id space of an allocator is used up.
    #[error("out of paths")]
    ResourceExhausted,
    #[error("exclusive use file already open")]
    Busy,
    #[error("unknown fid")]
    UnknownFid,
    #[error("fid already in use")]
    FidInUse,
    #[error("bad use of fid")]
    BadUseOfFid,
    #[error("not attached")]
    NotAttached,
    #[error("authentication not supported")]
    AuthNotSupported,
    #[error("{0}")]
    Invalid(String),
    /// An `RError` received by the client.
    #[error("{0}")]
    Remote(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    /// The ename carried by `RError`, at most `ERRMAX` bytes.
    pub fn ename(&self) -> String {
        let mut ename = self.to_string();
        if ename.len() > ERRMAX {
            let mut end = ERRMAX;
            while !ename.is_char_boundary(end) {
                end -= 1;
            }
            ename.truncate(end);
        }
        ename
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enames_follow_plan9_wording() {
        assert_eq!(Error::NotFound.ename(), "file does not exist");
        assert_eq!(Error::ResourceExhausted.ename(), "out of paths");
        assert_eq!(Error::invalid("bad ctl command").ename(), "bad ctl command");

        let io = Error::from(io::Error::other("connection reset"));
        assert_eq!(io.ename(), "connection reset");
    }

    #[test]
    fn long_enames_are_cut_at_a_char_boundary() {
        let e = Error::invalid(format!("bad file name: {}", "b".repeat(65530)));
        let ename = e.ename();
        assert_eq!(ename.len(), ERRMAX);
        assert!(ename.starts_with("bad file name: bbb"));

        // 'é' is two bytes and straddles the cut
        let e = Error::invalid(format!("{}{}", "a".repeat(ERRMAX - 1), "é"));
        assert_eq!(e.ename(), "a".repeat(ERRMAX - 1));
    }
}
