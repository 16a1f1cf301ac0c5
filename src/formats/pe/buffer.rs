//! Growable byte container backing an [`Image`](super::Image).
//!
//! Every access is bounds checked and reports [`PeError::OutOfBounds`]
//! instead of silently ignoring a bad offset.

use crate::formats::pe::types::{PeError, Result};

mod sealed {
    pub trait Sealed {}
}

/// Little-endian primitive that can be read from or written to a buffer.
pub trait Primitive: Copy + sealed::Sealed {
    const SIZE: usize;
    fn from_le_slice(bytes: &[u8]) -> Self;
    fn write_le_slice(self, out: &mut [u8]);
}

macro_rules! impl_primitive {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline(always)]
                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                #[inline(always)]
                fn write_le_slice(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_primitive!(u8, u16, u32, u64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Grow (zero-filled) or truncate to `len` bytes.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(PeError::OutOfBounds {
                offset,
                len,
                size: self.data.len(),
            }),
        }
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check(offset, len)?;
        Ok(&mut self.data[offset..offset + len])
    }

    #[inline]
    pub fn read<T: Primitive>(&self, offset: usize) -> Result<T> {
        self.check(offset, T::SIZE)?;
        Ok(T::from_le_slice(&self.data[offset..]))
    }

    #[inline]
    pub fn write<T: Primitive>(&mut self, offset: usize, value: T) -> Result<()> {
        self.check(offset, T::SIZE)?;
        value.write_le_slice(&mut self.data[offset..]);
        Ok(())
    }

    /// Overwrite `src.len()` bytes in place starting at `offset`.
    pub fn copy_data(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.slice_mut(offset, src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Splice `src` in at `offset`, shifting the tail. An offset past the end
    /// first grows the buffer with zeroes up to `offset`.
    pub fn insert_data(&mut self, offset: usize, src: &[u8]) {
        if offset > self.data.len() {
            self.data.resize(offset, 0);
        }
        self.data.splice(offset..offset, src.iter().copied());
    }

    pub fn fill(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.slice_mut(offset, len)?.fill(value);
        Ok(())
    }

    /// Read a NUL-terminated ASCII/UTF-8 string of at most `max_len` bytes.
    pub fn read_cstr(&self, offset: usize, max_len: usize) -> Result<&str> {
        if offset >= self.data.len() {
            return Err(PeError::InvalidOffset { offset });
        }
        let end = offset.saturating_add(max_len).min(self.data.len());
        let window = &self.data[offset..end];
        let len = memchr::memchr(0, window).unwrap_or(window.len());
        std::str::from_utf8(&window[..len]).map_err(|_| PeError::InvalidString)
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}
