//! Fixed-pattern canaries around tracked heap payloads.
//!
//! Every tracked allocation is laid out as
//!
//! ```plaintext
//! +------------------+  raw base (aligned to PAYLOAD_ALIGN)
//! | padding          |  FRONT_OFFSET - CANARY_SIZE bytes
//! +------------------+
//! | "ORHEADER"       |  CANARY_SIZE bytes
//! +------------------+  payload (returned to the caller)
//! | payload          |  size bytes
//! +------------------+
//! | "ORFOOTER"       |  CANARY_SIZE bytes
//! +------------------+
//! ```
//!
//! The metadata for the block lives in the registry, never in this memory, so
//! the only bytes an overrun can clobber are the two patterns.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::error::CorruptRegion;

/// Size of each canary region.
pub const CANARY_SIZE: usize = 8;

/// Alignment of every tracked payload.
pub const PAYLOAD_ALIGN: usize = 16;

/// Distance from the raw base to the payload.
pub const FRONT_OFFSET: usize = PAYLOAD_ALIGN;

/// Total overhead per tracked allocation.
pub const TOTAL_OVERHEAD: usize = FRONT_OFFSET + CANARY_SIZE;

/// An 8-byte sentinel pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canary {
    pub value: [u8; CANARY_SIZE],
}

/// Pattern written immediately before the payload.
pub const HEADER: Canary = Canary::new(*b"ORHEADER");

/// Pattern written immediately after the payload.
pub const FOOTER: Canary = Canary::new(*b"ORFOOTER");

impl Canary {
    #[must_use]
    pub const fn new(value: [u8; CANARY_SIZE]) -> Self {
        Self { value }
    }

    #[must_use]
    pub fn verify(&self, bytes: &[u8; CANARY_SIZE]) -> bool {
        self.value == *bytes
    }

    /// Write the pattern at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `CANARY_SIZE` bytes.
    pub unsafe fn write_at(&self, dst: *mut u8) {
        // SAFETY: forwarded to the caller.
        unsafe { std::ptr::copy_nonoverlapping(self.value.as_ptr(), dst, CANARY_SIZE) }
    }

    /// Compare the pattern against the bytes at `src`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `CANARY_SIZE` bytes.
    pub unsafe fn matches_at(&self, src: *const u8) -> bool {
        let mut actual = [0u8; CANARY_SIZE];
        // SAFETY: forwarded to the caller.
        unsafe { std::ptr::copy_nonoverlapping(src, actual.as_mut_ptr(), CANARY_SIZE) };
        self.verify(&actual)
    }
}

/// Raw layout for a payload of `size` bytes, or `None` on overflow.
#[must_use]
pub fn guarded_layout(size: usize) -> Option<Layout> {
    let total = size.checked_add(TOTAL_OVERHEAD)?;
    Layout::from_size_align(total, PAYLOAD_ALIGN).ok()
}

/// Payload address for a raw block.
///
/// # Safety
///
/// `raw` must be the start of a block allocated with [`guarded_layout`].
#[must_use]
pub(crate) unsafe fn payload_of(raw: NonNull<u8>) -> NonNull<u8> {
    // SAFETY: guarded blocks are at least TOTAL_OVERHEAD bytes long.
    unsafe { raw.add(FRONT_OFFSET) }
}

/// Raw block address for a payload.
///
/// # Safety
///
/// `payload` must have been produced by [`payload_of`].
#[must_use]
pub unsafe fn raw_of(payload: NonNull<u8>) -> NonNull<u8> {
    // SAFETY: forwarded to the caller.
    unsafe { payload.sub(FRONT_OFFSET) }
}

/// Write both canaries around a payload of `size` bytes.
///
/// # Safety
///
/// `payload` must sit inside a block laid out by [`guarded_layout`] for
/// `size`.
pub unsafe fn arm(payload: NonNull<u8>, size: usize) {
    // SAFETY: the header sits in the front offset and the footer directly
    // after the payload, both inside the guarded layout.
    unsafe {
        HEADER.write_at(payload.as_ptr().sub(CANARY_SIZE));
        FOOTER.write_at(payload.as_ptr().add(size));
    }
}

/// Check both canaries around a payload of `size` bytes.
///
/// # Safety
///
/// Same as [`arm`].
pub unsafe fn inspect(payload: NonNull<u8>, size: usize) -> Result<(), CorruptRegion> {
    // SAFETY: same bounds as `arm`.
    let (header_ok, footer_ok) = unsafe {
        (
            HEADER.matches_at(payload.as_ptr().sub(CANARY_SIZE)),
            FOOTER.matches_at(payload.as_ptr().add(size)),
        )
    };
    if !header_ok {
        return Err(CorruptRegion::Header);
    }
    if !footer_ok {
        return Err(CorruptRegion::Footer);
    }
    Ok(())
}
