//! Guest Memory Accessor - bounds-checked views into linear memory.
//!
//! Every pointer a cartridge hands to the host is a signed `i32` offset.
//! Nothing dereferences it until [`resolve`] has proven that the whole access,
//! `[offset, offset + length)`, lies inside the buffer.

use std::ops::Range;

use tracing::warn;

use crate::error::{BridgeError, Result};

/// Translate a guest offset and access length into a host range.
///
/// Succeeds iff `offset >= 0`, `length >= 0` and `offset + length <= capacity`.
#[inline]
pub fn resolve(capacity: usize, offset: i32, length: i64) -> Result<Range<usize>> {
    let range = usize::try_from(offset).ok().zip(usize::try_from(length).ok()).and_then(
        |(start, len)| {
            let end = start.checked_add(len)?;
            (end <= capacity).then_some(start..end)
        },
    );

    range.ok_or_else(|| {
        warn!(
            offset = offset,
            length = length,
            capacity = capacity,
            "Guest access refused"
        );
        BridgeError::OutOfBounds {
            offset,
            length,
            capacity,
        }
    })
}

/// Mutable counterpart of [`GuestMemory::slice`].
#[inline]
pub fn slice_mut(memory: &mut [u8], offset: i32, length: i64) -> Result<&mut [u8]> {
    let range = resolve(memory.len(), offset, length)?;
    Ok(&mut memory[range])
}

/// Read-only view over a cartridge's linear memory.
#[derive(Debug, Clone, Copy)]
pub struct GuestMemory<'a> {
    bytes: &'a [u8],
}

impl<'a> GuestMemory<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// The `length` bytes starting at `offset`.
    #[inline]
    pub fn slice(&self, offset: i32, length: i64) -> Result<&'a [u8]> {
        let range = resolve(self.bytes.len(), offset, length)?;
        Ok(&self.bytes[range])
    }

    /// A NUL-terminated string, without the terminator.
    ///
    /// Fails if memory ends before a NUL is found.
    pub fn c_str(&self, offset: i32) -> Result<&'a [u8]> {
        let start = resolve(self.bytes.len(), offset, 0)?.start;
        let tail = &self.bytes[start..];

        match tail.iter().position(|&b| b == 0) {
            Some(len) => Ok(&tail[..len]),
            // Unterminated: the terminator would sit one past the end.
            None => resolve(self.bytes.len(), offset, tail.len() as i64 + 1).map(|_| tail),
        }
    }

    /// Little-endian UTF-16 code units; an odd trailing byte is ignored.
    pub fn utf16_units(&self, offset: i32, byte_length: i64) -> Result<Vec<u16>> {
        let bytes = self.slice(offset, byte_length)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn array<const N: usize>(&self, offset: i32) -> Result<[u8; N]> {
        let bytes = self.slice(offset, N as i64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    #[inline]
    pub fn read_u32(&self, offset: i32) -> Result<u32> {
        self.array(offset).map(u32::from_le_bytes)
    }

    #[inline]
    pub fn read_i32(&self, offset: i32) -> Result<i32> {
        self.array(offset).map(i32::from_le_bytes)
    }

    #[inline]
    pub fn read_f64(&self, offset: i32) -> Result<f64> {
        self.array(offset).map(f64::from_le_bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
