//! Framing of authentication messages.
//!
//! A data message is four ASCII decimal digits giving its length, a newline,
//! then the data. An error is `!`, three digits, a newline and the error
//! string.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::{
    error::{AuthFailure, Error, string::*},
    utils::Result,
};

/// Length of either header
pub const HDRLEN: usize = 5;
/// Largest data payload
pub const MAXDATA: usize = 9999;
/// Largest error string
pub const MAXERR: usize = 999;

fn digits(b: &[u8]) -> Option<usize> {
    if b.is_empty() || !b.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(b.iter().fold(0, |n, d| n * 10 + (d - b'0') as usize))
}

/// Payload length announced by a header, `None` if `head` is not one.
fn announced(head: &[u8]) -> Option<usize> {
    if head.len() < HDRLEN || head[4] != b'\n' {
        return None;
    }
    match head[0] {
        b'!' => digits(&head[1..4]),
        _ => digits(&head[..4]),
    }
}

/// Whether the first bytes of a stream look like an authentication message.
pub fn is_keyring(head: &[u8]) -> bool {
    announced(head).is_some()
}

/// Frame `data` as a data message.
pub fn encode_data(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAXDATA {
        return Err(Error::No(EMSIZE));
    }
    let mut out = format!("{:04}\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    Ok(out)
}

/// Frame `msg` as an error message, truncated to fit.
pub fn encode_error(msg: &str) -> Vec<u8> {
    let mut end = msg.len().min(MAXERR);
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = format!("!{:03}\n", end).into_bytes();
    out.extend_from_slice(&msg.as_bytes()[..end]);
    out
}

/// Payload of a complete frame; an error frame becomes `AuthFailure::Remote`.
pub fn parse(frame: &[u8]) -> Result<Vec<u8>> {
    let len = announced(frame).ok_or(Error::No(EMALFORMED))?;
    let body = frame
        .get(HDRLEN..HDRLEN + len)
        .ok_or(Error::No(EMALFORMED))?;
    if frame[0] == b'!' {
        return Err(AuthFailure::Remote(String::from_utf8_lossy(body).into_owned()).into());
    }
    Ok(body.to_vec())
}

/// Cuts whole authentication messages, header included, out of a stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyringCodec;

impl Decoder for KeyringCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < HDRLEN {
            return Ok(None);
        }
        let len = announced(&src[..HDRLEN]).ok_or(Error::No(EMALFORMED))?;
        if src.len() < HDRLEN + len {
            src.reserve(HDRLEN + len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(HDRLEN + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_and_error_frames() {
        let frame = encode_data(b"v.2 p9sk1@plan9").unwrap();
        assert_eq!(&frame[..5], b"0015\n");
        assert_eq!(parse(&frame).unwrap(), b"v.2 p9sk1@plan9");

        let frame = encode_error("no such user");
        assert_eq!(&frame[..5], b"!012\n");
        match parse(&frame) {
            Err(Error::Auth(AuthFailure::Remote(s))) => assert_eq!(s, "no such user"),
            other => panic!("unexpected {:?}", other),
        }

        assert!(encode_data(&vec![0; MAXDATA + 1]).is_err());
        assert_eq!(encode_error(&"x".repeat(2000)).len(), HDRLEN + MAXERR);
    }

    #[test]
    fn detection() {
        assert!(is_keyring(b"0004\nabcd"));
        assert!(is_keyring(b"!003\nbad"));
        assert!(!is_keyring(b"00a4\n"));
        assert!(!is_keyring(&[19, 0, 0, 0, 100]));
        assert!(!is_keyring(b"0004"));
    }

    #[test]
    fn codec_splits_frames() {
        let mut codec = KeyringCodec;
        let mut buf = BytesMut::from(&b"0002\nOK0003"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"0002\nOK");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\nabc");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"0003\nabc");

        let mut bad = BytesMut::from(&b"xxxx\n"[..]);
        assert!(codec.decode(&mut bad).is_err());
    }
}
