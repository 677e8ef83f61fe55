//! Byte buffer with bounds-safe absolute and cursor-relative accessors.
//!
//! A [`Buffer`] is either fixed-size, where writes past the end are
//! truncated, or growable, where they extend the backing storage. Reads past
//! the end return `None` instead of failing. Every integer accessor takes an
//! [`Endian`] so both dialects can share one buffer type.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::mem::size_of;

/// Byte order of a single value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Behaviour of writes beyond the current length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Fixed,
    Growable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
    mode: Mode,
}

macro_rules! int_accessors {
    ($t:ty, $get_at:ident, $put_at:ident, $get:ident, $put:ident, $read:ident, $write:ident) => {
        pub fn $get_at(&self, off: usize, order: Endian) -> Option<$t> {
            let b = self.slice_at(off, size_of::<$t>())?;
            Some(match order {
                Endian::Little => LittleEndian::$read(b),
                Endian::Big => BigEndian::$read(b),
            })
        }

        pub fn $put_at(&mut self, off: usize, v: $t, order: Endian) -> usize {
            let mut b = [0u8; size_of::<$t>()];
            match order {
                Endian::Little => LittleEndian::$write(&mut b, v),
                Endian::Big => BigEndian::$write(&mut b, v),
            }
            self.write_at(off, &b)
        }

        pub fn $get(&mut self, order: Endian) -> Option<$t> {
            let v = self.$get_at(self.pos, order)?;
            self.pos += size_of::<$t>();
            Some(v)
        }

        pub fn $put(&mut self, v: $t, order: Endian) -> usize {
            let n = self.$put_at(self.pos, v, order);
            self.pos += n;
            n
        }
    };
}

impl Buffer {
    /// Zero-filled buffer of exactly `size` bytes.
    pub fn fixed(size: usize) -> Buffer {
        Buffer {
            data: vec![0; size],
            pos: 0,
            mode: Mode::Fixed,
        }
    }

    /// Empty buffer that grows as it is written.
    pub fn growable() -> Buffer {
        Buffer {
            data: Vec::new(),
            pos: 0,
            mode: Mode::Growable,
        }
    }

    /// Fixed-size buffer over existing bytes, cursor at the start.
    pub fn wrap(data: Vec<u8>) -> Buffer {
        Buffer {
            data,
            pos: 0,
            mode: Mode::Fixed,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Bytes between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn slice_at(&self, off: usize, n: usize) -> Option<&[u8]> {
        let end = off.checked_add(n)?;
        self.data.get(off..end)
    }

    /// Copy `bytes` to `off`, returning how many bytes landed in the buffer.
    fn write_at(&mut self, off: usize, bytes: &[u8]) -> usize {
        match self.mode {
            Mode::Fixed => {
                if off >= self.data.len() {
                    return 0;
                }
                let n = bytes.len().min(self.data.len() - off);
                self.data[off..off + n].copy_from_slice(&bytes[..n]);
                n
            }
            Mode::Growable => {
                let end = off + bytes.len();
                if end > self.data.len() {
                    self.data.resize(end, 0);
                }
                self.data[off..end].copy_from_slice(bytes);
                bytes.len()
            }
        }
    }

    pub fn get_u8_at(&self, off: usize) -> Option<u8> {
        self.data.get(off).copied()
    }

    pub fn put_u8_at(&mut self, off: usize, v: u8) -> usize {
        self.write_at(off, &[v])
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        let v = self.get_u8_at(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    pub fn put_u8(&mut self, v: u8) -> usize {
        let n = self.put_u8_at(self.pos, v);
        self.pos += n;
        n
    }

    int_accessors!(u16, get_u16_at, put_u16_at, get_u16, put_u16, read_u16, write_u16);
    int_accessors!(u32, get_u32_at, put_u32_at, get_u32, put_u32, read_u32, write_u32);
    int_accessors!(u64, get_u64_at, put_u64_at, get_u64, put_u64, read_u64, write_u64);

    pub fn get_bytes_at(&self, off: usize, n: usize) -> Option<&[u8]> {
        self.slice_at(off, n)
    }

    pub fn put_bytes_at(&mut self, off: usize, bytes: &[u8]) -> usize {
        self.write_at(off, bytes)
    }

    pub fn get_bytes(&mut self, n: usize) -> Option<Vec<u8>> {
        let v = self.slice_at(self.pos, n)?.to_vec();
        self.pos += n;
        Some(v)
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> usize {
        let n = self.write_at(self.pos, bytes);
        self.pos += n;
        n
    }

    /// String stored in a field of `width` bytes, padded with NULs.
    pub fn get_fixed_str_at(&self, off: usize, width: usize) -> Option<String> {
        let field = self.slice_at(off, width)?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(width);
        Some(String::from_utf8_lossy(&field[..end]).into_owned())
    }

    /// Store `s` in a `width`-byte field, truncating or NUL-padding it.
    pub fn put_fixed_str_at(&mut self, off: usize, s: &str, width: usize) -> usize {
        let mut field = vec![0u8; width];
        let n = s.len().min(width);
        field[..n].copy_from_slice(&s.as_bytes()[..n]);
        self.write_at(off, &field)
    }

    pub fn get_fixed_str(&mut self, width: usize) -> Option<String> {
        let s = self.get_fixed_str_at(self.pos, width)?;
        self.pos += width;
        Some(s)
    }

    pub fn put_fixed_str(&mut self, s: &str, width: usize) -> usize {
        let n = self.put_fixed_str_at(self.pos, s, width);
        self.pos += n;
        n
    }

    /// NUL-terminated string and the number of bytes it occupied,
    /// terminator included.
    pub fn get_cstr_at(&self, off: usize) -> Option<(String, usize)> {
        let tail = self.data.get(off..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        Some((String::from_utf8_lossy(&tail[..end]).into_owned(), end + 1))
    }

    pub fn put_cstr_at(&mut self, off: usize, s: &str) -> usize {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.write_at(off, &bytes)
    }

    pub fn get_cstr(&mut self) -> Option<String> {
        let (s, n) = self.get_cstr_at(self.pos)?;
        self.pos += n;
        Some(s)
    }

    pub fn put_cstr(&mut self, s: &str) -> usize {
        let n = self.put_cstr_at(self.pos, s);
        self.pos += n;
        n
    }

    /// String preceded by its 16-bit length.
    pub fn get_str16_at(&self, off: usize, order: Endian) -> Option<String> {
        let len = self.get_u16_at(off, order)? as usize;
        let bytes = self.slice_at(off + 2, len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn put_str16_at(&mut self, off: usize, s: &str, order: Endian) -> usize {
        let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
        let n = self.put_u16_at(off, bytes.len() as u16, order);
        if n < 2 {
            return n;
        }
        n + self.write_at(off + 2, bytes)
    }

    pub fn get_str16(&mut self, order: Endian) -> Option<String> {
        let len = self.get_u16_at(self.pos, order)? as usize;
        let s = self.get_str16_at(self.pos, order)?;
        self.pos += 2 + len;
        Some(s)
    }

    pub fn put_str16(&mut self, s: &str, order: Endian) -> usize {
        let n = self.put_str16_at(self.pos, s, order);
        self.pos += n;
        n
    }
}

impl From<Buffer> for Vec<u8> {
    fn from(buf: Buffer) -> Vec<u8> {
        buf.data
    }
}
