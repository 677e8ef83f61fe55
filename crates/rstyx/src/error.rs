//! Error representations.
//!
//! In 9P2000 and Styx errors travel to the client as strings. The static
//! strings used by the engine live in [`string`]; namespace implementations
//! may return any of them through [`Error::No`] or build their own with
//! [`Error::Msg`].

use std::{borrow::Cow, io};

use thiserror::Error;

/// Reasons an authentication attempt is abandoned.
///
/// The `Display` form is the diagnostic string handlers keep for the caller.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("challenge mismatch")]
    ChallengeMismatch,
    #[error("possible replay attack")]
    Replay,
    #[error("decryption or verification failed")]
    Decrypt,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer reported: {0}")]
    Remote(String),
    #[error("protocol {0} is not supported")]
    Unsupported(String),
}

/// Error type shared by the codec, channel, auth and server modules.
#[derive(Debug, Error)]
pub enum Error {
    /// One of the static error strings in [`string`].
    #[error("{0}")]
    No(&'static str),
    /// Any other error string destined for the wire.
    #[error("{0}")]
    Msg(String),
    /// I/O error from the transport or the namespace.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Authentication failure, terminal for the attempt.
    #[error("{0}")]
    Auth(#[from] AuthFailure),
    /// Channel security failure, fatal to the connection.
    #[error("secure channel: {0}")]
    Channel(Cow<'static, str>),
}

impl Error {
    /// The string sent to the client in an error reply.
    pub fn ename(&self) -> Cow<'_, str> {
        match self {
            Error::No(s) => Cow::Borrowed(*s),
            Error::Msg(s) => Cow::Borrowed(s.as_str()),
            Error::Io(e) => match e.raw_os_error() {
                Some(code) => Cow::Borrowed(nix::errno::Errno::from_raw(code).desc()),
                None => Cow::Owned(e.to_string()),
            },
            Error::Auth(f) => Cow::Owned(f.to_string()),
            Error::Channel(s) => Cow::Owned(format!("secure channel: {s}")),
        }
    }

    /// Whether the error must tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Channel(_) | Error::Io(_))
    }
}

/// Error strings sent in `Rerror`.
pub mod string {
    pub const EFIDINUSE: &str = "fid already in use";
    pub const EBADFID: &str = "unknown fid";
    pub const ENOENT: &str = "no such file";
    pub const EPERM: &str = "permission denied";
    pub const ENOAUTH: &str = "not authenticated";
    pub const EAUTHNONE: &str = "authentication not required";
    pub const EAUTHINCOMPLETE: &str = "authentication not complete";
    pub const ENONS: &str = "no namespace available";
    pub const EMSIZE: &str = "implausible message size";
    pub const ENOTAG: &str = "version must use NOTAG";
    pub const ENOTOPEN: &str = "fid not open";
    pub const EOPENED: &str = "fid already open";
    pub const ENOTDIR: &str = "not a directory";
    pub const EISDIR: &str = "is a directory";
    pub const EBADOFFSET: &str = "bad directory read offset";
    pub const EBADNAME: &str = "illegal name";
    pub const ETOOMANY: &str = "too many names in walk";
    pub const EMALFORMED: &str = "malformed message";
    pub const EBADTYPE: &str = "unexpected message type";
    pub const EACCESSMODE: &str = "file not open for this mode";
    pub const EUNSUPPORTED: &str = "operation not supported";
    pub const ERAW: &str = "raw access unsupported on a layered channel";
    pub const ENOFRAMING: &str = "channel framing not configured";
    pub const ENEGOTIATE: &str = "version not negotiated";
    pub const EAUTHFID: &str = "fid is an authentication fid";
}
