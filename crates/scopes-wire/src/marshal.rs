//! Payload marshalling
//!
//! Operation arguments and results travel as opaque payload bytes inside a
//! request or response PDU. This module provides the small set of encodings
//! the servant tables need:
//!
//! | Rust Type                   | Encoding                                   |
//! |-----------------------------|--------------------------------------------|
//! | bool                        | 1 byte (0 or 1)                            |
//! | u8 / u32 / i64              | little-endian, natural size                |
//! | String                      | u32 length + UTF-8 bytes                   |
//! | Option<String>              | presence byte + String                     |
//! | BTreeMap<String, String>    | u32 entry count + (String, String) pairs   |
//!
//! Strings are length-prefixed, never null-terminated.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Types that can be appended to a payload buffer.
pub trait Marshal {
    fn marshal(&self, buf: &mut BytesMut);
}

/// Types that can be read back from a payload buffer.
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut Bytes) -> Result<Self>;
}

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(WireError::BufferUnderflow {
            needed,
            have: buf.remaining(),
        });
    }
    Ok(())
}

macro_rules! impl_marshal_primitive {
    ($ty:ty, $size:expr, $put:ident, $get:ident) => {
        impl Marshal for $ty {
            fn marshal(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl Unmarshal for $ty {
            fn unmarshal(buf: &mut Bytes) -> Result<Self> {
                ensure(buf, $size)?;
                Ok(buf.$get())
            }
        }
    };
}

impl_marshal_primitive!(u8, 1, put_u8, get_u8);
impl_marshal_primitive!(u32, 4, put_u32_le, get_u32_le);
impl_marshal_primitive!(i64, 8, put_i64_le, get_i64_le);

impl Marshal for bool {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl Unmarshal for bool {
    fn unmarshal(buf: &mut Bytes) -> Result<Self> {
        match u8::unmarshal(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidPdu(format!("invalid boolean byte {}", other))),
        }
    }
}

impl Marshal for str {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }
}

impl Marshal for String {
    fn marshal(&self, buf: &mut BytesMut) {
        self.as_str().marshal(buf);
    }
}

impl Unmarshal for String {
    fn unmarshal(buf: &mut Bytes) -> Result<Self> {
        let len = u32::unmarshal(buf)? as usize;
        ensure(buf, len)?;
        let raw = buf.split_to(len);
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

impl Marshal for Option<String> {
    fn marshal(&self, buf: &mut BytesMut) {
        match self {
            Some(s) => {
                true.marshal(buf);
                s.marshal(buf);
            }
            None => false.marshal(buf),
        }
    }
}

impl Unmarshal for Option<String> {
    fn unmarshal(buf: &mut Bytes) -> Result<Self> {
        if bool::unmarshal(buf)? {
            Ok(Some(String::unmarshal(buf)?))
        } else {
            Ok(None)
        }
    }
}

impl Marshal for BTreeMap<String, String> {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        for (k, v) in self {
            k.marshal(buf);
            v.marshal(buf);
        }
    }
}

impl Unmarshal for BTreeMap<String, String> {
    fn unmarshal(buf: &mut Bytes) -> Result<Self> {
        let count = u32::unmarshal(buf)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let k = String::unmarshal(buf)?;
            let v = String::unmarshal(buf)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

/// Incremental payload writer.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value and return the writer for chaining.
    pub fn put<T: Marshal + ?Sized>(mut self, value: &T) -> Self {
        value.marshal(&mut self.buf);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Sequential payload reader.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn get<T: Unmarshal>(&mut self) -> Result<T> {
        T::unmarshal(&mut self.buf)
    }

    /// Fail if unread bytes remain.
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(WireError::InvalidPdu(format!(
                "{} trailing payload bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
