//! Serialize/deserialize 9P2000 messages into/from binary.

use std::io::{Cursor, Read};
use std::mem;
use std::ops::Shl;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::BytesMut;
use enum_primitive::*;

use super::{Dialect, MessageCodec};
use crate::{
    error::{Error, string::*},
    fcall::*,
    io_err,
};

type IoResult<T> = ::std::io::Result<T>;

/// Registry key
pub const NAME: &str = "9P2000";

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

/// Read `size` bytes, allocating only as much as the input really holds.
fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> IoResult<Vec<u8>> {
    let mut buf = Vec::new();
    Read::take(&mut *r, size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return Err(io_err!(UnexpectedEof, "declared length exceeds message"));
    }
    Ok(buf)
}

enum_from_primitive! {
    #[doc = "Message type, 9P2000 operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TError          = 106,  // Illegal, never used
        RError,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// Message type carrying `fcall`, if 9P2000 has one
    pub fn of(fcall: &FCall) -> Option<MsgType> {
        Some(match *fcall {
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::RError { .. } => MsgType::RError,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
            FCall::TNop | FCall::RNop => return None,
        })
    }
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(IoResult<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: decoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> IoResult<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        if self.len() > u16::MAX as usize {
            return Err(io_err!(InvalidInput, "string too long"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Encode type, tag and body; the caller prepends the size.
fn encode_body<W: WriteBytesExt>(w: &mut W, typ: MsgType, msg: &Msg) -> IoResult<usize> {
    use crate::FCall::*;

    let buf = Encoder::new(w) << &(typ as u8) << &msg.tag;

    let buf = match msg.body {
        TVersion {
            ref msize,
            ref version,
        } => buf << msize << version,
        RVersion {
            ref msize,
            ref version,
        } => buf << msize << version,
        TAuth {
            ref afid,
            ref uname,
            ref aname,
        } => buf << afid << uname << aname,
        RAuth { ref aqid } => buf << aqid,
        TAttach {
            ref fid,
            ref afid,
            ref uname,
            ref aname,
        } => buf << fid << afid << uname << aname,
        RAttach { ref qid } => buf << qid,
        RError { ref ename } => buf << ename,
        TFlush { ref oldtag } => buf << oldtag,
        RFlush => buf,
        TWalk {
            ref fid,
            ref newfid,
            ref wnames,
        } => buf << fid << newfid << wnames,
        RWalk { ref wqids } => buf << wqids,
        TOpen { ref fid, ref mode } => buf << fid << mode,
        ROpen {
            ref qid,
            ref iounit,
        } => buf << qid << iounit,
        TCreate {
            ref fid,
            ref name,
            ref perm,
            ref mode,
        } => buf << fid << name << perm << mode,
        RCreate {
            ref qid,
            ref iounit,
        } => buf << qid << iounit,
        TRead {
            ref fid,
            ref offset,
            ref count,
        } => buf << fid << offset << count,
        RRead { ref data } => buf << data,
        TWrite {
            ref fid,
            ref offset,
            ref data,
        } => buf << fid << offset << data,
        RWrite { ref count } => buf << count,
        TClunk { ref fid } => buf << fid,
        RClunk => buf,
        TRemove { ref fid } => buf << fid,
        RRemove => buf,
        TStat { ref fid } => buf << fid,
        RStat { ref stat } => buf << &(stat.size() + 2) << stat,
        TWStat { ref fid, ref stat } => buf << fid << &(stat.size() + 2) << stat,
        RWStat => buf,
        TNop | RNop => return Err(io_err!(InvalidInput, "not a 9P2000 message")),
    };

    match buf {
        SResult(Ok(b)) => Ok(b.bytes_written()),
        SResult(Err(e)) => Err(e),
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        let _size: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Stat preceded by the extra 16-bit count used in `RStat`/`TWStat`
fn decode_counted_stat<R: ReadBytesExt>(r: &mut R) -> IoResult<Stat> {
    let _n: u16 = Decodable::decode(r)?;
    Decodable::decode(r)
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        use self::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => FCall::RStat {
                stat: decode_counted_stat(buf)?,
            },
            Some(TWStat) => FCall::TWStat {
                fid: decode!(buf),
                stat: decode_counted_stat(buf)?,
            },
            Some(RWStat) => FCall::RWStat,
            Some(TError) | None => return Err(io_err!(Other, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// The 9P2000 dialect
#[derive(Clone, Copy, Debug, Default)]
pub struct NineP2000;

impl Dialect for NineP2000 {
    fn name(&self) -> &'static str {
        NAME
    }

    fn framing(&self) -> MessageCodec {
        MessageCodec::length_prefixed()
    }

    fn decode(&self, frame: &[u8]) -> crate::Result<Msg> {
        if frame.len() < 7 {
            return Err(Error::No(EMALFORMED));
        }
        let mut cursor = Cursor::new(frame);
        let size: u32 = Decodable::decode(&mut cursor).map_err(|_| Error::No(EMALFORMED))?;
        if size as usize != frame.len() {
            return Err(Error::No(EMALFORMED));
        }
        let msg: Msg = Decodable::decode(&mut cursor).map_err(|_| Error::No(EMALFORMED))?;
        if cursor.position() as usize != frame.len() {
            return Err(Error::No(EMALFORMED));
        }
        Ok(msg)
    }

    fn tag_of(&self, frame: &[u8]) -> Option<u16> {
        frame.get(5..7).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn encode(&self, msg: &Msg, _request: Option<&FCall>) -> crate::Result<BytesMut> {
        let typ = MsgType::of(&msg.body).ok_or(Error::No(EBADTYPE))?;
        let mut body = Vec::with_capacity(64);
        encode_body(&mut body, typ, msg)?;

        let mut frame = BytesMut::with_capacity(body.len() + 4);
        frame.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn encode_stat(&self, stat: &Stat) -> Vec<u8> {
        let mut out = Vec::with_capacity(stat.size() as usize + 2);
        // Writing into a Vec cannot fail; strings longer than 64k are cut by the namespace.
        let _ = stat.encode(&mut out);
        out
    }

    fn max_msize(&self) -> Option<u32> {
        None
    }

    fn needs_version(&self) -> bool {
        true
    }
}
