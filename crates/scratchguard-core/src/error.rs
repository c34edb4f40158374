//! Error taxonomy for the scratch arena and the tracking heap.

use thiserror::Error;

/// Which part of a tracked block failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptRegion {
    /// The 8-byte pattern immediately before the payload.
    Header,
    /// The 8-byte pattern immediately after the payload.
    Footer,
    /// The pointer is not a live tracked block (double free or foreign pointer).
    Unregistered,
}

impl std::fmt::Display for CorruptRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Header => "header canary",
            Self::Footer => "footer canary",
            Self::Unregistered => "unregistered pointer",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    /// Arena buffer exhausted. Handled inside the arena by falling back to
    /// the raw allocator; callers only see it in logs.
    #[error("temp arena overflow: requested {requested} bytes with {remaining} of {capacity} left")]
    ArenaOverflow {
        requested: usize,
        remaining: usize,
        capacity: usize,
    },
    #[error("invalid mark {mark}: arena cursor is at {offset}")]
    InvalidMark { mark: usize, offset: usize },
    #[error("alignment {align} is not a power of two")]
    InvalidAlignment { align: usize },
    #[error("heap corruption detected at {addr:#x}: {region}")]
    CorruptionDetected { addr: usize, region: CorruptRegion },
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
}

impl MemError {
    /// Fatal errors stop the program under the default assert hook.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidMark { .. } | Self::CorruptionDetected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MemError>;
