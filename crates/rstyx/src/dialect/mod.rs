//! Wire encodings of the operation set in [`crate::fcall`].
//!
//! Two dialects are provided: [`v2`] (9P2000, length-prefixed, variable
//! strings) and [`v1`] (Styx, fixed-size fields validated against a size
//! table). Both implement [`Dialect`] and are looked up by name through
//! [`registry`].

pub mod v1;
pub mod v2;

use std::{fmt, sync::Arc};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LengthDelimitedCodec};

use crate::{
    error::Error,
    fcall::{FCall, Msg, Stat},
    registry::Registry,
    utils::Result,
};

/// One wire encoding of the protocol.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Registry key of the dialect.
    fn name(&self) -> &'static str;

    /// Codec which cuts whole messages out of a byte stream.
    fn framing(&self) -> MessageCodec;

    /// Decode one complete wire message.
    fn decode(&self, frame: &[u8]) -> Result<Msg>;

    /// Tag of a frame which may not decode, for addressing the error reply.
    fn tag_of(&self, frame: &[u8]) -> Option<u16>;

    /// Encode `msg` to its complete wire form.
    ///
    /// `request` is the T-message a reply answers; dialects whose replies
    /// echo request fields need it.
    fn encode(&self, msg: &Msg, request: Option<&FCall>) -> Result<BytesMut>;

    /// Encode a stat record as it appears in directory reads.
    fn encode_stat(&self, stat: &Stat) -> Vec<u8>;

    /// Upper bound on message size fixed by the dialect itself.
    fn max_msize(&self) -> Option<u32>;

    /// Whether a session must start with `TVersion`.
    fn needs_version(&self) -> bool;
}

pub type DialectFactory = fn() -> Arc<dyn Dialect>;

/// All dialects known to the server.
pub fn registry() -> Registry<DialectFactory> {
    let mut reg: Registry<DialectFactory> = Registry::new("dialect");
    reg.register(v2::NAME, || Arc::new(v2::NineP2000))
        .register(v1::NAME, || Arc::new(v1::Styx));
    reg
}

/// Guess the dialect from the first bytes a client sends.
///
/// A 9P2000 session opens with `TVersion` after a four byte length, a Styx
/// session with a small even T-message type.
pub fn detect(head: &[u8]) -> Option<&'static str> {
    if head.len() >= 5 && head[4] == v2::MsgType::TVersion as u8 {
        return Some(v2::NAME);
    }
    match head.first() {
        Some(&t) if v1::is_request(t) => Some(v1::NAME),
        _ => None,
    }
}

/// Stream framing of plain (unlayered) messages.
#[derive(Debug)]
pub enum MessageCodec {
    Length(LengthDelimitedCodec),
    Styx(v1::StyxCodec),
}

impl MessageCodec {
    /// 4-byte little-endian length which counts itself, kept in the frame.
    pub fn length_prefixed() -> MessageCodec {
        MessageCodec::Length(
            LengthDelimitedCodec::builder()
                .length_field_offset(0)
                .length_field_length(4)
                .length_adjustment(0)
                .num_skip(0)
                .little_endian()
                .new_codec(),
        )
    }
}

impl Decoder for MessageCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        match self {
            MessageCodec::Length(codec) => Ok(codec.decode(src)?),
            MessageCodec::Styx(codec) => codec.decode(src),
        }
    }
}
