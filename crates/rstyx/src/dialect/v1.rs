//! The Styx dialect: fixed-size fields, 16-bit fids, one name per walk.
//!
//! Every message type has an exact size, or a minimum size plus a 16-bit
//! data count at a known offset. Frames are cut from the stream with the
//! same table used to validate them.

use bytes::BytesMut;
use enum_primitive::*;
use tokio_util::codec::Decoder;

use super::{Dialect, MessageCodec};
use crate::{
    buffer::{Buffer, Endian},
    error::{Error, string::*},
    fcall::*,
    utils::Result,
};

/// Registry key
pub const NAME: &str = "styx";

/// Width of names in walk, create, attach and stat
pub const NAMELEN: usize = 28;
/// Width of the error string in `Rerror`
pub const ERRLEN: usize = 64;
/// Size of an encoded stat record
pub const STATLEN: usize = 116;
/// Largest data payload of a read or write
pub const MAXFDATA: u32 = 8192;
/// Directory bit of a qid path
pub const CHDIR: u32 = 0x8000_0000;

const LE: Endian = Endian::Little;

enum_from_primitive! {
    #[doc = "Message type, Styx operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TNop        = 0,
        RNop,
        TError,     // Illegal, never used
        RError,
        TFlush,
        RFlush,
        TClone,
        RClone,
        TWalk,
        RWalk,
        TOpen,
        ROpen,
        TCreate,
        RCreate,
        TRead,
        RRead,
        TWrite,
        RWrite,
        TClunk,
        RClunk,
        TRemove,
        RRemove,
        TStat,
        RStat,
        TWStat,
        RWStat,
        TSession,   // Unused
        RSession,   // Unused
        TAttach,
        RAttach,
    }
}

/// Wire size of one message type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Size {
    Invalid,
    Exact(usize),
    /// Fixed part, then as many data bytes as the u16 at `count_at` says.
    Counted { min: usize, count_at: usize },
}

static SIZES: [Size; 30] = [
    Size::Exact(3),   // Tnop
    Size::Exact(3),   // Rnop
    Size::Invalid,    // Terror
    Size::Exact(3 + ERRLEN),
    Size::Exact(5),   // Tflush
    Size::Exact(3),   // Rflush
    Size::Exact(7),   // Tclone
    Size::Exact(5),   // Rclone
    Size::Exact(5 + NAMELEN),
    Size::Exact(13),  // Rwalk
    Size::Exact(6),   // Topen
    Size::Exact(13),  // Ropen
    Size::Exact(5 + NAMELEN + 5),
    Size::Exact(13),  // Rcreate
    Size::Exact(15),  // Tread
    Size::Counted { min: 8, count_at: 5 },
    Size::Counted { min: 16, count_at: 13 },
    Size::Exact(7),   // Rwrite
    Size::Exact(5),   // Tclunk
    Size::Exact(5),   // Rclunk
    Size::Exact(5),   // Tremove
    Size::Exact(5),   // Rremove
    Size::Exact(5),   // Tstat
    Size::Exact(5 + STATLEN),
    Size::Exact(5 + STATLEN),
    Size::Exact(5),   // Rwstat
    Size::Exact(11),  // Tsession
    Size::Exact(87),  // Rsession
    Size::Exact(5 + 2 * NAMELEN),
    Size::Exact(13),  // Rattach
];

/// Whether `typ` opens a valid T-message.
pub fn is_request(typ: u8) -> bool {
    typ % 2 == 0 && (typ as usize) < SIZES.len() && SIZES[typ as usize] != Size::Invalid
}

/// Full length of the frame starting at `head`, once enough of it is known.
///
/// Only an unknown type leaves the length undecidable. An oversized count
/// still frames, so the message can be refused without losing the stream.
fn frame_len(head: &[u8]) -> Result<Option<usize>> {
    let Some(&typ) = head.first() else {
        return Ok(None);
    };
    match SIZES.get(typ as usize) {
        None | Some(Size::Invalid) => Err(Error::No(EBADTYPE)),
        Some(&Size::Exact(n)) => Ok(Some(n)),
        Some(&Size::Counted { min, count_at }) => {
            Ok(data_count(head, count_at).map(|count| min + count as usize))
        }
    }
}

fn data_count(head: &[u8], count_at: usize) -> Option<u32> {
    let b = head.get(count_at..count_at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]) as u32)
}

/// Cuts Styx frames out of a byte stream by message type.
#[derive(Clone, Copy, Debug, Default)]
pub struct StyxCodec;

impl Decoder for StyxCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        match frame_len(&src[..])? {
            Some(n) if src.len() >= n => Ok(Some(src.split_to(n))),
            Some(n) => {
                src.reserve(n - src.len());
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

fn fid16(fid: u32) -> Result<u16> {
    u16::try_from(fid).map_err(|_| Error::No(EBADFID))
}

fn get_qid(buf: &mut Buffer) -> Option<QId> {
    let path = buf.get_u32(LE)?;
    let version = buf.get_u32(LE)?;
    Some(QId {
        typ: if path & CHDIR != 0 {
            QIdType::DIR
        } else {
            QIdType::FILE
        },
        version,
        path: (path & !CHDIR) as u64,
    })
}

fn put_qid(buf: &mut Buffer, qid: &QId) {
    let mut path = (qid.path as u32) & !CHDIR;
    if qid.is_dir() {
        path |= CHDIR;
    }
    buf.put_u32(path, LE);
    buf.put_u32(qid.version, LE);
}

fn get_stat(buf: &mut Buffer) -> Option<Stat> {
    let name = buf.get_fixed_str(NAMELEN)?;
    let uid = buf.get_fixed_str(NAMELEN)?;
    let gid = buf.get_fixed_str(NAMELEN)?;
    let qid = get_qid(buf)?;
    let mode = buf.get_u32(LE)?;
    let atime = buf.get_u32(LE)?;
    let mtime = buf.get_u32(LE)?;
    let length = buf.get_u64(LE)?;
    let typ = buf.get_u16(LE)?;
    let dev = buf.get_u16(LE)? as u32;
    Some(Stat {
        typ,
        dev,
        qid,
        mode,
        atime,
        mtime,
        length,
        name,
        uid,
        gid,
        muid: String::new(),
    })
}

fn put_stat(buf: &mut Buffer, stat: &Stat) {
    buf.put_fixed_str(&stat.name, NAMELEN);
    buf.put_fixed_str(&stat.uid, NAMELEN);
    buf.put_fixed_str(&stat.gid, NAMELEN);
    put_qid(buf, &stat.qid);
    buf.put_u32(stat.mode, LE);
    buf.put_u32(stat.atime, LE);
    buf.put_u32(stat.mtime, LE);
    buf.put_u64(stat.length, LE);
    buf.put_u16(stat.typ, LE);
    buf.put_u16(stat.dev as u16, LE);
}

/// Fid a reply echoes, taken from the request it answers.
fn reply_fid(request: Option<&FCall>) -> u16 {
    let fid = match request {
        Some(FCall::TAttach { fid, .. }) => Some(*fid),
        Some(req) => req.fids().first().copied(),
        None => None,
    };
    fid.and_then(|f| u16::try_from(f).ok()).unwrap_or(0)
}

fn decode_body(buf: &mut Buffer, typ: MsgType, len: usize) -> Option<Result<FCall>> {
    use self::MsgType::*;

    let body = match typ {
        TNop => FCall::TNop,
        RNop => FCall::RNop,
        RError => FCall::RError {
            ename: buf.get_fixed_str(ERRLEN)?,
        },
        TFlush => FCall::TFlush {
            oldtag: buf.get_u16(LE)?,
        },
        RFlush => FCall::RFlush,
        TClone => FCall::TWalk {
            fid: buf.get_u16(LE)? as u32,
            newfid: buf.get_u16(LE)? as u32,
            wnames: Vec::new(),
        },
        RClone => {
            buf.get_u16(LE)?;
            FCall::RWalk { wqids: Vec::new() }
        }
        TWalk => {
            let fid = buf.get_u16(LE)? as u32;
            FCall::TWalk {
                fid,
                newfid: fid,
                wnames: vec![buf.get_fixed_str(NAMELEN)?],
            }
        }
        RWalk => {
            buf.get_u16(LE)?;
            FCall::RWalk {
                wqids: vec![get_qid(buf)?],
            }
        }
        TOpen => FCall::TOpen {
            fid: buf.get_u16(LE)? as u32,
            mode: buf.get_u8()?,
        },
        ROpen | RCreate | RAttach => {
            buf.get_u16(LE)?;
            let qid = get_qid(buf)?;
            match typ {
                ROpen => FCall::ROpen { qid, iounit: 0 },
                RCreate => FCall::RCreate { qid, iounit: 0 },
                _ => FCall::RAttach { qid },
            }
        }
        TCreate => FCall::TCreate {
            fid: buf.get_u16(LE)? as u32,
            name: buf.get_fixed_str(NAMELEN)?,
            perm: buf.get_u32(LE)?,
            mode: buf.get_u8()?,
        },
        TRead => FCall::TRead {
            fid: buf.get_u16(LE)? as u32,
            offset: buf.get_u64(LE)?,
            count: buf.get_u16(LE)? as u32,
        },
        RRead => {
            buf.get_u16(LE)?;
            let count = buf.get_u16(LE)? as usize;
            buf.get_u8()?;
            FCall::RRead {
                data: Data(buf.get_bytes(count)?),
            }
        }
        TWrite => {
            let fid = buf.get_u16(LE)? as u32;
            let offset = buf.get_u64(LE)?;
            let count = buf.get_u16(LE)? as usize;
            buf.get_u8()?;
            FCall::TWrite {
                fid,
                offset,
                data: Data(buf.get_bytes(count)?),
            }
        }
        RWrite => {
            buf.get_u16(LE)?;
            FCall::RWrite {
                count: buf.get_u16(LE)? as u32,
            }
        }
        TClunk => FCall::TClunk {
            fid: buf.get_u16(LE)? as u32,
        },
        TRemove => FCall::TRemove {
            fid: buf.get_u16(LE)? as u32,
        },
        TStat => FCall::TStat {
            fid: buf.get_u16(LE)? as u32,
        },
        RClunk | RRemove | RWStat => {
            buf.get_u16(LE)?;
            match typ {
                RClunk => FCall::RClunk,
                RRemove => FCall::RRemove,
                _ => FCall::RWStat,
            }
        }
        RStat => {
            buf.get_u16(LE)?;
            FCall::RStat {
                stat: get_stat(buf)?,
            }
        }
        TWStat => FCall::TWStat {
            fid: buf.get_u16(LE)? as u32,
            stat: get_stat(buf)?,
        },
        TAttach => FCall::TAttach {
            fid: buf.get_u16(LE)? as u32,
            afid: NOFID,
            uname: buf.get_fixed_str(NAMELEN)?,
            aname: buf.get_fixed_str(NAMELEN)?,
        },
        TSession | RSession => return Some(Err(Error::No(EUNSUPPORTED))),
        TError => return Some(Err(Error::No(EBADTYPE))),
    };

    if buf.position() != len {
        return Some(Err(Error::No(EMALFORMED)));
    }
    Some(Ok(body))
}

fn encode_body(buf: &mut Buffer, msg: &Msg, request: Option<&FCall>) -> Result<MsgType> {
    use crate::FCall::*;

    let typ = match msg.body {
        TNop => MsgType::TNop,
        RNop => MsgType::RNop,
        RError { ref ename } => {
            buf.put_fixed_str(ename, ERRLEN);
            MsgType::RError
        }
        TFlush { oldtag } => {
            buf.put_u16(oldtag, LE);
            MsgType::TFlush
        }
        RFlush => MsgType::RFlush,
        TWalk {
            fid,
            newfid,
            ref wnames,
        } => match wnames.as_slice() {
            [] => {
                buf.put_u16(fid16(fid)?, LE);
                buf.put_u16(fid16(newfid)?, LE);
                MsgType::TClone
            }
            [name] if newfid == fid => {
                buf.put_u16(fid16(fid)?, LE);
                buf.put_fixed_str(name, NAMELEN);
                MsgType::TWalk
            }
            _ => return Err(Error::No(EUNSUPPORTED)),
        },
        RWalk { ref wqids } => {
            let clone = match request {
                Some(TWalk { wnames, .. }) => wnames.is_empty(),
                _ => wqids.is_empty(),
            };
            buf.put_u16(reply_fid(request), LE);
            if clone {
                MsgType::RClone
            } else {
                put_qid(buf, wqids.first().ok_or(Error::No(EMALFORMED))?);
                MsgType::RWalk
            }
        }
        TOpen { fid, mode } => {
            buf.put_u16(fid16(fid)?, LE);
            buf.put_u8(mode);
            MsgType::TOpen
        }
        ROpen { ref qid, .. } | RCreate { ref qid, .. } | RAttach { ref qid } => {
            buf.put_u16(reply_fid(request), LE);
            put_qid(buf, qid);
            match msg.body {
                ROpen { .. } => MsgType::ROpen,
                RCreate { .. } => MsgType::RCreate,
                _ => MsgType::RAttach,
            }
        }
        TCreate {
            fid,
            ref name,
            perm,
            mode,
        } => {
            buf.put_u16(fid16(fid)?, LE);
            buf.put_fixed_str(name, NAMELEN);
            buf.put_u32(perm, LE);
            buf.put_u8(mode);
            MsgType::TCreate
        }
        TRead { fid, offset, count } => {
            buf.put_u16(fid16(fid)?, LE);
            buf.put_u64(offset, LE);
            buf.put_u16(count.min(MAXFDATA) as u16, LE);
            MsgType::TRead
        }
        RRead { ref data } => {
            if data.0.len() > MAXFDATA as usize {
                return Err(Error::No(EMSIZE));
            }
            buf.put_u16(reply_fid(request), LE);
            buf.put_u16(data.0.len() as u16, LE);
            buf.put_u8(0);
            buf.put_bytes(&data.0);
            MsgType::RRead
        }
        TWrite {
            fid,
            offset,
            ref data,
        } => {
            if data.0.len() > MAXFDATA as usize {
                return Err(Error::No(EMSIZE));
            }
            buf.put_u16(fid16(fid)?, LE);
            buf.put_u64(offset, LE);
            buf.put_u16(data.0.len() as u16, LE);
            buf.put_u8(0);
            buf.put_bytes(&data.0);
            MsgType::TWrite
        }
        RWrite { count } => {
            buf.put_u16(reply_fid(request), LE);
            buf.put_u16(count.min(MAXFDATA) as u16, LE);
            MsgType::RWrite
        }
        TClunk { fid } | TRemove { fid } | TStat { fid } => {
            buf.put_u16(fid16(fid)?, LE);
            match msg.body {
                TClunk { .. } => MsgType::TClunk,
                TRemove { .. } => MsgType::TRemove,
                _ => MsgType::TStat,
            }
        }
        RClunk | RRemove | RWStat => {
            buf.put_u16(reply_fid(request), LE);
            match msg.body {
                RClunk => MsgType::RClunk,
                RRemove => MsgType::RRemove,
                _ => MsgType::RWStat,
            }
        }
        RStat { ref stat } => {
            buf.put_u16(reply_fid(request), LE);
            put_stat(buf, stat);
            MsgType::RStat
        }
        TWStat { fid, ref stat } => {
            buf.put_u16(fid16(fid)?, LE);
            put_stat(buf, stat);
            MsgType::TWStat
        }
        TAttach {
            fid,
            ref uname,
            ref aname,
            ..
        } => {
            buf.put_u16(fid16(fid)?, LE);
            buf.put_fixed_str(uname, NAMELEN);
            buf.put_fixed_str(aname, NAMELEN);
            MsgType::TAttach
        }
        TVersion { .. } | RVersion { .. } | TAuth { .. } | RAuth { .. } => {
            return Err(Error::No(EUNSUPPORTED));
        }
    };
    Ok(typ)
}

/// The Styx dialect
#[derive(Clone, Copy, Debug, Default)]
pub struct Styx;

impl Dialect for Styx {
    fn name(&self) -> &'static str {
        NAME
    }

    fn framing(&self) -> MessageCodec {
        MessageCodec::Styx(StyxCodec)
    }

    fn decode(&self, frame: &[u8]) -> Result<Msg> {
        let len = frame_len(frame)?.ok_or(Error::No(EMALFORMED))?;
        if len != frame.len() {
            return Err(Error::No(EMALFORMED));
        }
        if let Some(&Size::Counted { count_at, .. }) = SIZES.get(frame[0] as usize) {
            if data_count(frame, count_at).is_some_and(|count| count > MAXFDATA) {
                return Err(Error::No(EMSIZE));
            }
        }
        let mut buf = Buffer::wrap(frame.to_vec());
        let typ = buf
            .get_u8()
            .and_then(MsgType::from_u8)
            .ok_or(Error::No(EBADTYPE))?;
        let tag = buf.get_u16(LE).ok_or(Error::No(EMALFORMED))?;
        let body = decode_body(&mut buf, typ, len).ok_or(Error::No(EMALFORMED))??;
        Ok(Msg { tag, body })
    }

    fn tag_of(&self, frame: &[u8]) -> Option<u16> {
        frame.get(1..3).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn encode(&self, msg: &Msg, request: Option<&FCall>) -> Result<BytesMut> {
        let mut buf = Buffer::growable();
        buf.set_position(3);
        let typ = encode_body(&mut buf, msg, request)?;
        buf.put_u8_at(0, typ as u8);
        buf.put_u16_at(1, msg.tag, LE);
        Ok(BytesMut::from(&buf.as_slice()[..]))
    }

    fn encode_stat(&self, stat: &Stat) -> Vec<u8> {
        let mut buf = Buffer::fixed(STATLEN);
        put_stat(&mut buf, stat);
        buf.into_inner()
    }

    fn max_msize(&self) -> Option<u32> {
        Some(MAXFDATA + IOHDRSZ)
    }

    fn needs_version(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_size(msg: &Msg, request: Option<&FCall>) -> BytesMut {
        let frame = Styx.encode(msg, request).unwrap();
        assert_eq!(frame_len(&frame).unwrap(), Some(frame.len()));
        frame
    }

    #[test]
    fn table_sizes() {
        let attach = Msg {
            tag: 1,
            body: FCall::TAttach {
                fid: 3,
                afid: NOFID,
                uname: "inferno".into(),
                aname: "".into(),
            },
        };
        assert_eq!(check_size(&attach, None).len(), 61);
        assert_eq!(Styx.decode(&check_size(&attach, None)).unwrap(), attach);

        let rerror = Msg {
            tag: 1,
            body: FCall::RError {
                ename: "no such file".into(),
            },
        };
        assert_eq!(check_size(&rerror, None).len(), 67);

        let stat = Msg {
            tag: 2,
            body: FCall::RStat {
                stat: Stat::default(),
            },
        };
        assert_eq!(check_size(&stat, Some(&FCall::TStat { fid: 1 })).len(), 121);
    }

    #[test]
    fn clone_and_walk_map_onto_twalk() {
        let clone = [6u8, 5, 0, 1, 0, 2, 0];
        assert_eq!(
            Styx.decode(&clone).unwrap(),
            Msg {
                tag: 5,
                body: FCall::TWalk {
                    fid: 1,
                    newfid: 2,
                    wnames: vec![]
                }
            }
        );

        let walk = Msg {
            tag: 6,
            body: FCall::TWalk {
                fid: 2,
                newfid: 2,
                wnames: vec!["dev".into()],
            },
        };
        let frame = check_size(&walk, None);
        assert_eq!(frame[0], MsgType::TWalk as u8);
        assert_eq!(Styx.decode(&frame).unwrap(), walk);

        let rclone = Msg {
            tag: 5,
            body: FCall::RWalk { wqids: vec![] },
        };
        let frame = check_size(&rclone, Some(&Styx.decode(&clone).unwrap().body));
        assert_eq!(&frame[..], &[7, 5, 0, 1, 0]);
    }

    #[test]
    fn directory_bit_lives_in_qid_path() {
        let qid = QId {
            typ: QIdType::DIR,
            version: 7,
            path: 9,
        };
        let reply = Msg {
            tag: 1,
            body: FCall::RAttach { qid },
        };
        let attach = FCall::TAttach {
            fid: 4,
            afid: NOFID,
            uname: "u".into(),
            aname: "".into(),
        };
        let frame = check_size(&reply, Some(&attach));
        assert_eq!(&frame[3..5], &[4, 0]);
        assert_eq!(&frame[5..9], &(9 | CHDIR).to_le_bytes());
        assert_eq!(Styx.decode(&frame).unwrap(), reply);
    }

    #[test]
    fn counted_messages() {
        let write = Msg {
            tag: 4,
            body: FCall::TWrite {
                fid: 1,
                offset: 10,
                data: Data(b"styx".to_vec()),
            },
        };
        let frame = check_size(&write, None);
        assert_eq!(frame.len(), 16 + 4);
        assert_eq!(Styx.decode(&frame).unwrap(), write);

        let stat = Stat {
            name: "chan".into(),
            uid: "inferno".into(),
            gid: "inferno".into(),
            mode: dm::DIR | 0o555,
            qid: QId {
                typ: QIdType::DIR,
                version: 0,
                path: 1,
            },
            length: 0,
            ..Default::default()
        };
        assert_eq!(Styx.encode_stat(&stat).len(), STATLEN);
        let twstat = Msg {
            tag: 8,
            body: FCall::TWStat { fid: 1, stat },
        };
        assert_eq!(Styx.decode(&check_size(&twstat, None)).unwrap(), twstat);
    }

    #[test]
    fn bad_frames() {
        assert!(Styx.decode(&[2, 0, 0]).is_err());
        assert!(Styx.decode(&[0, 0, 0, 0]).is_err());
        assert!(Styx.decode(&[26, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(Styx.decode(&[40, 0, 0]).is_err());
        assert_eq!(Styx.tag_of(&[40, 9, 0]), Some(9));
        assert!(is_request(28) && !is_request(2) && !is_request(29) && !is_request(48));
    }

    #[test]
    fn codec_waits_for_whole_frame() {
        let mut codec = StyxCodec;
        let mut buf = BytesMut::from(&[16u8, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[2, 0, 0, b'h']);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[b'i', 0]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 18);
        assert_eq!(&buf[..], &[0]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_write_frames_and_is_refused() {
        let mut frame = vec![16u8, 4, 0, 1, 0];
        frame.extend_from_slice(&[0; 8]);
        frame.extend_from_slice(&9000u16.to_le_bytes());
        frame.push(0);
        frame.resize(16 + 9000, b'x');

        let mut buf = BytesMut::from(&frame[..]);
        buf.extend_from_slice(&[18, 5, 0, 1, 0]);

        let mut codec = StyxCodec;
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.len(), 16 + 9000);
        assert!(matches!(Styx.decode(&first), Err(Error::No(e)) if e == EMSIZE));
        assert_eq!(Styx.tag_of(&first), Some(4));

        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            Styx.decode(&next).unwrap(),
            Msg {
                tag: 5,
                body: FCall::TClunk { fid: 1 },
            }
        );
    }

    #[test]
    fn unknown_type_cannot_be_framed() {
        let mut buf = BytesMut::from(&[40u8, 1, 0, 0, 0][..]);
        assert!(StyxCodec.decode(&mut buf).is_err());
    }
}
