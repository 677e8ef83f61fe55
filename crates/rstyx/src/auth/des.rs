//! DES helpers of the Plan 9 authentication protocols.
//!
//! Keys are 56 bits long and expanded with odd parity before use. Buffers
//! longer than one block are processed with a 7-byte stride so every byte is
//! covered, the last block overlapping its predecessor.

use des::{
    Des,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};

use crate::error::AuthFailure;

/// Length of a 56-bit key
pub const DESKEYLEN: usize = 7;
/// Width of user and authentication ids
pub const ANAMELEN: usize = 28;

pub type Key = [u8; DESKEYLEN];

/// Set the low bit of `b << 1` so the byte has odd parity.
fn parity(b: u8) -> u8 {
    let v = b << 1;
    v | ((v.count_ones() as u8 + 1) & 1)
}

/// Expand a 56-bit key to the 64-bit form DES takes.
pub fn des56to64(k56: &Key) -> [u8; 8] {
    let hi = u32::from_be_bytes([k56[0], k56[1], k56[2], k56[3]]);
    let lo = u32::from_be_bytes([k56[4], k56[5], k56[6], 0]);
    [
        parity((hi >> 25) as u8 & 0x7f),
        parity((hi >> 18) as u8 & 0x7f),
        parity((hi >> 11) as u8 & 0x7f),
        parity((hi >> 4) as u8 & 0x7f),
        parity(((hi << 3) | (lo >> 29)) as u8 & 0x7f),
        parity((lo >> 22) as u8 & 0x7f),
        parity((lo >> 15) as u8 & 0x7f),
        parity((lo >> 8) as u8 & 0x7f),
    ]
}

fn cipher(key: &Key) -> Des {
    Des::new(GenericArray::from_slice(&des56to64(key)))
}

/// Block offsets in encryption order.
fn strides(len: usize) -> Vec<usize> {
    let n = len - 1;
    let (blocks, rest) = (n / 7, n % 7);
    let mut offs: Vec<usize> = (0..blocks).map(|i| i * 7).collect();
    if rest != 0 {
        offs.push(blocks * 7 - 7 + rest);
    }
    offs
}

/// Encrypt `buf` in place, first block first.
pub fn encrypt(key: &Key, buf: &mut [u8]) -> Result<(), AuthFailure> {
    if buf.len() < 8 {
        return Err(AuthFailure::Decrypt);
    }
    let des = cipher(key);
    for off in strides(buf.len()) {
        des.encrypt_block(GenericArray::from_mut_slice(&mut buf[off..off + 8]));
    }
    Ok(())
}

/// Decrypt `buf` in place, last block first.
pub fn decrypt(key: &Key, buf: &mut [u8]) -> Result<(), AuthFailure> {
    if buf.len() < 8 {
        return Err(AuthFailure::Decrypt);
    }
    let des = cipher(key);
    for off in strides(buf.len()).into_iter().rev() {
        des.decrypt_block(GenericArray::from_mut_slice(&mut buf[off..off + 8]));
    }
    Ok(())
}

/// Derive a key from a password.
///
/// The password is cut to `ANAMELEN - 1` bytes; each 8-byte window is folded
/// into the key and encrypted with the key built so far.
pub fn passtokey(password: &str) -> Key {
    let mut buf = [0u8; ANAMELEN];
    buf[..8].fill(b' ');
    let p = password.as_bytes();
    let mut n = p.len().min(ANAMELEN - 1);
    buf[..n].copy_from_slice(&p[..n]);
    buf[n] = 0;

    let mut key = [0u8; DESKEYLEN];
    let mut t = 0;
    loop {
        for i in 0..DESKEYLEN {
            key[i] = (buf[t + i] >> i).wrapping_add(buf[t + i + 1] << (7 - i));
        }
        if n <= 8 {
            return key;
        }
        n -= 8;
        t += 8;
        if n < 8 {
            t -= 8 - n;
            n = 8;
        }
        let des = cipher(&key);
        des.encrypt_block(GenericArray::from_mut_slice(&mut buf[t..t + 8]));
    }
}
