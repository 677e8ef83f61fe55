//! Protocol data types and constants shared by both dialects.
//!
//! [`FCall`] is the dialect-neutral operation set the engine works on. Each
//! dialect in [`crate::dialect`] maps its own wire encoding onto it.

use std::mem::{size_of, size_of_val};

use bitflags::bitflags;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with RVersion when the server does not understand
/// the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that authentication is
/// not required, the afid field in the attach message should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Ample room for `TWrite`/`RRead` header
///
/// size[4] TRead/TWrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Maximum number of names in one `TWalk`
pub const MAXWELEM: usize = 16;

/// Smallest msize a client may negotiate
pub const MIN_MSIZE: u32 = 256;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 32;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 64;

    /// Whether `mode` permits reading.
    pub fn readable(mode: u8) -> bool {
        matches!(mode & 3, READ | RDWR | EXEC)
    }

    /// Whether `mode` permits writing.
    pub fn writable(mode: u8) -> bool {
        matches!(mode & 3, WRITE | RDWR)
    }
}

/// Bits in Stat.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in QId.typ
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QIdType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl QIdType {
    /// Qid type bits corresponding to the high byte of a stat mode.
    pub fn from_mode(mode: u32) -> QIdType {
        QIdType::from_bits_truncate((mode >> 24) as u8)
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QId {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QIdType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl QId {
    pub fn is_dir(&self) -> bool {
        self.typ.contains(QIdType::DIR)
    }
}

/// Namespace metadata (somewhat like a unix fstat)
///
/// NOTE: Defined as `Dir` in libc.h of Plan 9
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: QId,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Stat {
    /// Size of the 9P2000 encoding, excluding the leading size field
    pub fn size(&self) -> u16 {
        (size_of_val(&self.typ)
            + size_of_val(&self.dev)
            + size_of::<u8>()
            + size_of::<u32>()
            + size_of::<u64>()
            + size_of_val(&self.mode)
            + size_of_val(&self.atime)
            + size_of_val(&self.mtime)
            + size_of_val(&self.length)
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()) as u16
    }

    pub fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }
}

/// Data type used in `RRead` and `TWrite`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

/// A data type encapsulating the operations common to both dialects
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
    /// Styx only
    TNop,
    /// Styx only
    RNop,
}

impl FCall {
    /// Get the fids which self contains
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            FCall::TAttach { afid, .. } if afid != NOFID => vec![afid],
            FCall::TWalk { fid, .. } => vec![fid],
            FCall::TOpen { fid, .. } => vec![fid],
            FCall::TCreate { fid, .. } => vec![fid],
            FCall::TRead { fid, .. } => vec![fid],
            FCall::TWrite { fid, .. } => vec![fid],
            FCall::TClunk { fid } => vec![fid],
            FCall::TRemove { fid } => vec![fid],
            FCall::TStat { fid } => vec![fid],
            FCall::TWStat { fid, .. } => vec![fid],
            _ => Vec::new(),
        }
    }
}

/// Envelope for messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various messages
    pub body: FCall,
}
