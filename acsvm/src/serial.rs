//! Binary codec shared by the bytecode loader and the save-state format.
//!
//! Integers are written as VLNs: little-endian groups of 7 bits, the high bit
//! of each byte set while more bytes follow.

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::error::ReadError;

/// Unsigned integer types that can travel as a VLN.
pub trait Vln: Copy {
    const NAME: &'static str;
    const BITS: u32;

    fn from_u64(v: u64) -> Self;
    fn to_u64(self) -> u64;
}

macro_rules! impl_vln {
    ($($ty:ty),*) => {
        $(
            impl Vln for $ty {
                const NAME: &'static str = stringify!($ty);
                const BITS: u32 = <$ty>::BITS;

                #[inline]
                fn from_u64(v: u64) -> Self {
                    v as $ty
                }

                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }
            }
        )*
    };
}

impl_vln!(u8, u16, u32, u64, usize);

// Upper bound on the bytes of one VLN, padded encodings included.
const MAX_VLN_BYTES: u32 = 10;

pub fn read_vln<T: Vln, R: Read + ?Sized>(r: &mut R) -> Result<T, ReadError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    for _ in 0..MAX_VLN_BYTES {
        let byte = r.read_u8()?;
        let payload = (byte & 0x7F) as u64;

        if payload != 0 {
            if shift >= 64 || (payload << shift) >> shift != payload {
                return Err(ReadError::Overflow(T::NAME));
            }
            value |= payload << shift;
        }

        if byte & 0x80 == 0 {
            if T::BITS < 64 && value >> T::BITS != 0 {
                return Err(ReadError::Overflow(T::NAME));
            }
            return Ok(T::from_u64(value));
        }
        shift += 7;
    }

    Err(ReadError::Overflow(T::NAME))
}

pub fn write_vln<T: Vln, W: Write + ?Sized>(w: &mut W, value: T) -> io::Result<()> {
    let mut v = value.to_u64();
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            return w.write_u8(byte);
        }
        w.write_u8(byte | 0x80)?;
    }
}

/// Writes `value` as exactly `width` bytes, padding with continuation bytes.
///
/// Readers accept the overlong form, so a slot can be reserved and patched
/// later without moving the bytes that follow it.
pub fn write_vln_padded<T: Vln, W: Write + ?Sized>(w: &mut W, value: T, width: usize) -> io::Result<()> {
    let mut v = value.to_u64();
    if width == 0 || (width < 10 && v >> (7 * width) != 0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("value {v} does not fit in {width} VLN bytes"),
        ));
    }

    for i in 0..width {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if i + 1 != width {
            byte |= 0x80;
        }
        w.write_u8(byte)?;
    }
    Ok(())
}

/// Writes a signed word through its unsigned bit pattern.
pub fn write_svln<W: Write + ?Sized>(w: &mut W, value: i32) -> io::Result<()> {
    write_vln(w, value as u32)
}

pub fn read_svln<R: Read + ?Sized>(r: &mut R) -> Result<i32, ReadError> {
    Ok(read_vln::<u32, _>(r)? as i32)
}

pub fn read_block<R: Read + ?Sized>(r: &mut R, len: usize) -> Result<Vec<u8>, ReadError> {
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(ReadError::UnexpectedEof);
    }
    Ok(buf)
}

pub fn write_block<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_all(bytes)
}

/// Length-prefixed byte string.
pub fn read_string<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>, ReadError> {
    let len = read_vln::<usize, _>(r)?;
    read_block(r, len)
}

pub fn write_string<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_vln(w, bytes.len())?;
    write_block(w, bytes)
}

pub fn read_sign<R: Read + ?Sized>(r: &mut R, expected: &[u8; 4]) -> Result<(), ReadError> {
    let mut found = [0u8; 4];
    r.read_exact(&mut found)?;
    if &found != expected {
        return Err(ReadError::BadSignature {
            expected: *expected,
            found,
        });
    }
    Ok(())
}

pub fn write_sign<W: Write + ?Sized>(w: &mut W, sign: &[u8; 4]) -> io::Result<()> {
    w.write_all(sign)
}

pub fn read_bool<R: Read + ?Sized>(r: &mut R) -> Result<bool, ReadError> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(ReadError::malformed(format!("invalid bool byte {b:#04x}"))),
    }
}

pub fn write_bool<W: Write + ?Sized>(w: &mut W, value: bool) -> io::Result<()> {
    w.write_u8(value as u8)
}
