//! Type and permission bits of a file.

use std::fmt;

use crate::fcall::{QIdType, dm};

/// Type bits and owner/group/other permission triads, as in `Stat.mode`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Perm(pub u32);

/// The triad a requester is judged by.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Class {
    Owner,
    Group,
    Other,
}

impl Perm {
    /// Bits of the three permission triads.
    pub const RWX: u32 = 0o777;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_dir(self) -> bool {
        self.0 & dm::DIR != 0
    }

    pub fn is_append(self) -> bool {
        self.0 & dm::APPEND != 0
    }

    pub fn is_excl(self) -> bool {
        self.0 & dm::EXCL != 0
    }

    /// The type byte reported in the qid.
    pub fn qid_type(self) -> QIdType {
        QIdType::from_bits_truncate((self.0 >> 24) as u8)
    }

    /// The `rwx` bits granted to `class`.
    pub fn triad(self, class: Class) -> u32 {
        let shift = match class {
            Class::Owner => 6,
            Class::Group => 3,
            Class::Other => 0,
        };
        (self.0 >> shift) & 0o7
    }

    /// Whether `class` holds every bit of `want` (a combination of
    /// `dm::READ`, `dm::WRITE` and `dm::EXEC`).
    pub fn allows(self, class: Class, want: u32) -> bool {
        self.triad(class) & want == want
    }
}

impl From<u32> for Perm {
    fn from(bits: u32) -> Self {
        Perm(bits)
    }
}

// A zero bit closes a group of alternatives and prints '-' when none of
// them was set.
const PERM_CHARS: &[(u32, char)] = &[
    (dm::DIR, 'd'),
    (dm::APPEND, 'a'),
    (dm::AUTH, 'A'),
    (dm::DEVICE, 'D'),
    (dm::SOCKET, 'S'),
    (dm::NAMEDPIPE, 'P'),
    (0, '-'),
    (dm::EXCL, 'l'),
    (dm::SYMLINK, 'L'),
    (0, '-'),
    (0o400, 'r'),
    (0, '-'),
    (0o200, 'w'),
    (0, '-'),
    (0o100, 'x'),
    (0, '-'),
    (0o040, 'r'),
    (0, '-'),
    (0o020, 'w'),
    (0, '-'),
    (0o010, 'x'),
    (0, '-'),
    (0o004, 'r'),
    (0, '-'),
    (0o002, 'w'),
    (0, '-'),
    (0o001, 'x'),
    (0, '-'),
];

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut did = false;
        for &(bit, c) in PERM_CHARS {
            if self.0 & bit != 0 {
                did = true;
                write!(f, "{}", c)?;
            }
            if bit == 0 {
                if !did {
                    write!(f, "{}", c)?;
                }
                did = false;
            }
        }
        Ok(())
    }
}
