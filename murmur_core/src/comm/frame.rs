//! Wire frame layout and element padding math.
//!
//! Every message travels as `header | payload | pad`, where the header is a
//! single little-endian u64 carrying the unpadded payload byte length and
//! the pad brings the payload up to a multiple of the transport element
//! size. Pad bytes are arbitrary; receivers discard them based on the
//! header length. The header itself is staged through the same byte path
//! as payload and may be split across flushes.

use bytemuck::{Pod, Zeroable};

/// The transport moves data in fixed-size elements of this many bytes.
/// Staged lengths, slot offsets and slot capacities are all multiples of it.
pub const ELEMENT_SIZE: usize = 8;

/// Byte length of the on-wire frame header.
pub const HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

/// On-wire frame header: the unpadded payload byte length.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameHeader {
    length: u64,
}

impl FrameHeader {
    /// Header for a payload of `len` bytes.
    #[inline]
    pub fn new(len: usize) -> Self {
        Self {
            length: (len as u64).to_le(),
        }
    }

    /// Unpadded payload byte length this header announces.
    #[inline]
    pub fn payload_len(&self) -> usize {
        u64::from_le(self.length) as usize
    }

    /// Wire representation, ready for staging.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        bytemuck::cast_ref(self)
    }

    /// Decode a header from its wire representation.
    #[inline]
    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        bytemuck::cast(bytes)
    }
}

/// Round a byte length up to the next multiple of [`ELEMENT_SIZE`].
#[inline]
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(ELEMENT_SIZE) * ELEMENT_SIZE
}
