//! Digest and encryption record layer.
//!
//! Each record starts with a two byte big-endian length. When the top bit is
//! set the body is unpadded; otherwise a third header byte gives the number
//! of pad bytes at the end of the decrypted body. The digest is an HMAC over
//! the big-endian record count followed by the payload, appended before
//! encryption. Counts and cipher chaining state are kept per direction and
//! never reset.

use std::sync::Mutex;

use bytes::{BufMut, BytesMut};
use des::{
    Des,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;

use super::Layer;
use crate::{auth::des::des56to64, error::Error, utils::Result};

/// Largest record body
pub const MAXRECORD: usize = 0x7fff;
const NOPAD: u16 = 0x8000;
/// Payload carried by one record, leaving room for digest and padding
const CHUNK: usize = 0x4000;

/// Keyed digest appended to each record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Digest {
    Sha1,
    Md5,
}

impl Digest {
    fn len(self) -> usize {
        match self {
            Digest::Sha1 => 20,
            Digest::Md5 => 16,
        }
    }

    fn mac(self, key: &[u8], count: u32, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            Digest::Sha1 => Ok(keyed::<Hmac<Sha1>>(key, count, payload)?.finalize().into_bytes().to_vec()),
            Digest::Md5 => Ok(keyed::<Hmac<Md5>>(key, count, payload)?.finalize().into_bytes().to_vec()),
        }
    }

    /// Check `tag` against the digest of `payload` in constant time.
    fn verify(self, key: &[u8], count: u32, payload: &[u8], tag: &[u8]) -> Result<()> {
        let res = match self {
            Digest::Sha1 => keyed::<Hmac<Sha1>>(key, count, payload)?.verify_slice(tag),
            Digest::Md5 => keyed::<Hmac<Md5>>(key, count, payload)?.verify_slice(tag),
        };
        res.map_err(|_| Error::Channel("digest mismatch".into()))
    }
}

fn keyed<M: Mac + hmac::digest::KeyInit>(key: &[u8], count: u32, payload: &[u8]) -> Result<M> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|_| Error::Channel("bad digest key".into()))?;
    mac.update(&count.to_be_bytes());
    mac.update(payload);
    Ok(mac)
}

/// Block cipher mode applied to the record body.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CipherMode {
    DesEcb,
    DesCbc,
}

/// Digest and cipher halves of an algorithm string such as `"sha1/des_cbc"`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Algorithm {
    pub digest: Option<Digest>,
    pub cipher: Option<CipherMode>,
}

impl Algorithm {
    pub fn parse(name: &str) -> Result<Algorithm> {
        let mut alg = Algorithm::default();
        if name.is_empty() || name == "none" || name == "clear" {
            return Ok(alg);
        }
        for part in name.split('/') {
            match part {
                "sha1" if alg.digest.is_none() => alg.digest = Some(Digest::Sha1),
                "md5" if alg.digest.is_none() => alg.digest = Some(Digest::Md5),
                "des_ecb" if alg.cipher.is_none() => alg.cipher = Some(CipherMode::DesEcb),
                "des_cbc" if alg.cipher.is_none() => alg.cipher = Some(CipherMode::DesCbc),
                _ => return Err(Error::Msg(format!("unknown channel algorithm: {}", name))),
            }
        }
        Ok(alg)
    }

    pub fn is_none(&self) -> bool {
        self.digest.is_none() && self.cipher.is_none()
    }
}

#[derive(Clone)]
struct CipherState {
    des: Des,
    mode: CipherMode,
    ivec: [u8; 8],
}

impl CipherState {
    fn encrypt(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(8) {
            if self.mode == CipherMode::DesCbc {
                block.iter_mut().zip(self.ivec.iter()).for_each(|(b, v)| *b ^= v);
            }
            self.des.encrypt_block(GenericArray::from_mut_slice(block));
            if self.mode == CipherMode::DesCbc {
                self.ivec.copy_from_slice(block);
            }
        }
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(8) {
            let mut next = [0u8; 8];
            next.copy_from_slice(block);
            self.des.decrypt_block(GenericArray::from_mut_slice(block));
            if self.mode == CipherMode::DesCbc {
                block.iter_mut().zip(self.ivec.iter()).for_each(|(b, v)| *b ^= v);
                self.ivec = next;
            }
        }
    }
}

/// Per-direction state.
#[derive(Clone, Default)]
struct Direction {
    count: u32,
    cipher: Option<CipherState>,
}

/// Record layer keyed by a shared secret.
pub struct SecureLayer {
    name: String,
    alg: Algorithm,
    secret: Vec<u8>,
    rx: Mutex<Direction>,
    tx: Mutex<Direction>,
}

impl std::fmt::Debug for SecureLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureLayer")
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

fn des_key(secret: &[u8]) -> Result<[u8; 8]> {
    match secret.len() {
        7 => {
            let mut k7 = [0u8; 7];
            k7.copy_from_slice(secret);
            Ok(des56to64(&k7))
        }
        n if n >= 8 => {
            let mut k = [0u8; 8];
            k.copy_from_slice(&secret[..8]);
            Ok(k)
        }
        _ => Err(Error::Channel("secret too short for des".into())),
    }
}

impl SecureLayer {
    /// `alg` is an algorithm string, `secret` the key both ends share.
    pub fn new(alg: &str, secret: &[u8]) -> Result<SecureLayer> {
        let parsed = Algorithm::parse(alg)?;
        let mut dir = Direction::default();
        if let Some(mode) = parsed.cipher {
            let key = des_key(secret)?;
            let des = <Des as KeyInit>::new_from_slice(&key)
                .map_err(|_| Error::Channel("bad des key".into()))?;
            let mut ivec = [0u8; 8];
            if let Some(iv) = secret.get(8..16) {
                ivec.copy_from_slice(iv);
            }
            dir.cipher = Some(CipherState { des, mode, ivec });
        }
        Ok(SecureLayer {
            name: format!("secure({})", alg),
            alg: parsed,
            secret: secret.to_vec(),
            rx: Mutex::new(dir.clone()),
            tx: Mutex::new(dir),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.alg
    }

    fn seal(&self, dir: &mut Direction, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        let mut body = payload.to_vec();
        if let Some(digest) = self.alg.digest {
            body.extend(digest.mac(&self.secret, dir.count, payload)?);
        }
        dir.count = dir.count.wrapping_add(1);

        let mut pad = 0;
        if let Some(cipher) = dir.cipher.as_mut() {
            pad = (8 - body.len() % 8) % 8;
            body.resize(body.len() + pad, 0);
            cipher.encrypt(&mut body);
        }
        if body.len() > MAXRECORD {
            return Err(Error::Channel("record too long".into()));
        }

        if pad == 0 {
            out.put_u16(body.len() as u16 | NOPAD);
        } else {
            out.put_u16(body.len() as u16);
            out.put_u8(pad as u8);
        }
        out.extend_from_slice(&body);
        Ok(())
    }
}

impl Layer for SecureLayer {
    fn name(&self) -> &str {
        &self.name
    }

    /// Record body preceded by its pad count.
    fn split_record(&self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let h = u16::from_be_bytes([src[0], src[1]]);
        let (hdr, len, pad) = if h & NOPAD != 0 {
            (2, (h & !NOPAD) as usize, 0)
        } else {
            if src.len() < 3 {
                return Ok(None);
            }
            (3, h as usize, src[2])
        };
        if src.len() < hdr + len {
            src.reserve(hdr + len - src.len());
            return Ok(None);
        }
        let mut record = src.split_to(hdr + len);
        let _ = record.split_to(hdr - 1);
        record[0] = pad;
        Ok(Some(record))
    }

    fn inbound(&self, mut record: BytesMut) -> Result<BytesMut> {
        let pad = record[0] as usize;
        let mut body = record.split_off(1);

        let mut dir = self
            .rx
            .lock()
            .map_err(|_| Error::Channel("receive state poisoned".into()))?;
        if let Some(cipher) = dir.cipher.as_mut() {
            if body.len() % 8 != 0 {
                return Err(Error::Channel("bad record length".into()));
            }
            cipher.decrypt(&mut body);
        }
        if pad > body.len() {
            return Err(Error::Channel("bad padding".into()));
        }
        body.truncate(body.len() - pad);

        if let Some(digest) = self.alg.digest {
            let n = digest.len();
            if body.len() < n {
                return Err(Error::Channel("short record".into()));
            }
            let tag = body.split_off(body.len() - n);
            digest.verify(&self.secret, dir.count, &body, &tag)?;
        }
        dir.count = dir.count.wrapping_add(1);
        Ok(body)
    }

    fn outbound(&self, payload: BytesMut) -> Result<BytesMut> {
        let mut dir = self
            .tx
            .lock()
            .map_err(|_| Error::Channel("send state poisoned".into()))?;
        let mut out = BytesMut::with_capacity(payload.len() + 32);
        if payload.is_empty() {
            self.seal(&mut dir, &payload, &mut out)?;
        }
        for chunk in payload.chunks(CHUNK) {
            self.seal(&mut dir, chunk, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdefghij";

    fn transfer(a: &SecureLayer, b: &SecureLayer, msg: &[u8]) -> BytesMut {
        let mut wire = a.outbound(BytesMut::from(msg)).unwrap();
        let mut out = BytesMut::new();
        while let Some(rec) = b.split_record(&mut wire).unwrap() {
            out.unsplit(b.inbound(rec).unwrap());
        }
        assert!(wire.is_empty());
        out
    }

    #[test]
    fn algorithm_strings() {
        assert!(Algorithm::parse("none").unwrap().is_none());
        assert_eq!(
            Algorithm::parse("sha1/des_cbc").unwrap(),
            Algorithm {
                digest: Some(Digest::Sha1),
                cipher: Some(CipherMode::DesCbc)
            }
        );
        assert_eq!(
            Algorithm::parse("des_ecb").unwrap().cipher,
            Some(CipherMode::DesEcb)
        );
        assert!(Algorithm::parse("rc4_128").is_err());
        assert!(Algorithm::parse("sha1/md5").is_err());
    }

    #[test]
    fn every_algorithm_round_trips() {
        for alg in ["none", "sha1", "md5", "des_ecb", "des_cbc", "sha1/des_cbc", "md5/des_ecb"] {
            let a = SecureLayer::new(alg, SECRET).unwrap();
            let b = SecureLayer::new(alg, SECRET).unwrap();
            for msg in [&b"hello styx"[..], &[7u8; 3000][..], b"x"] {
                assert_eq!(&transfer(&a, &b, msg)[..], msg, "{}", alg);
            }
        }
    }

    #[test]
    fn large_payload_spans_records() {
        let a = SecureLayer::new("sha1/des_cbc", SECRET).unwrap();
        let b = SecureLayer::new("sha1/des_cbc", SECRET).unwrap();
        let msg = vec![0xa5u8; CHUNK * 2 + 17];
        assert_eq!(&transfer(&a, &b, &msg)[..], &msg[..]);
    }

    #[test]
    fn encrypted_bytes_differ_and_cbc_chains() {
        let a = SecureLayer::new("des_cbc", SECRET).unwrap();
        let first = a.outbound(BytesMut::from(&[0u8; 8][..])).unwrap();
        let second = a.outbound(BytesMut::from(&[0u8; 8][..])).unwrap();
        assert_ne!(&first[2..], &[0u8; 8][..]);
        assert_ne!(first, second);
    }

    #[test]
    fn tampering_is_fatal() {
        let a = SecureLayer::new("sha1", SECRET).unwrap();
        let b = SecureLayer::new("sha1", SECRET).unwrap();
        let mut wire = a.outbound(BytesMut::from(&b"payload"[..])).unwrap();
        wire[3] ^= 1;
        let rec = b.split_record(&mut wire).unwrap().unwrap();
        let err = b.inbound(rec).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn flipped_digest_byte_is_a_mismatch() {
        let a = SecureLayer::new("md5", SECRET).unwrap();
        let b = SecureLayer::new("md5", SECRET).unwrap();
        let mut wire = a.outbound(BytesMut::from(&b"payload"[..])).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;
        let rec = b.split_record(&mut wire).unwrap().unwrap();
        let err = b.inbound(rec).unwrap_err();
        assert!(matches!(err, Error::Channel(ref m) if m == "digest mismatch"), "{:?}", err);
    }

    #[test]
    fn replayed_record_fails_the_counter() {
        let a = SecureLayer::new("md5", SECRET).unwrap();
        let b = SecureLayer::new("md5", SECRET).unwrap();
        let wire = a.outbound(BytesMut::from(&b"once"[..])).unwrap();

        let mut copy = wire.clone();
        let rec = b.split_record(&mut copy).unwrap().unwrap();
        b.inbound(rec).unwrap();

        let mut copy = wire.clone();
        let rec = b.split_record(&mut copy).unwrap().unwrap();
        assert!(b.inbound(rec).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let a = SecureLayer::new("sha1/des_ecb", SECRET).unwrap();
        let b = SecureLayer::new("sha1/des_ecb", b"another secret of 20").unwrap();
        let mut wire = a.outbound(BytesMut::from(&b"hello"[..])).unwrap();
        let rec = b.split_record(&mut wire).unwrap().unwrap();
        assert!(b.inbound(rec).is_err());
    }
}
