//! Block device contract for flash filesystem engines.
//!
//! A log-structured flash filesystem engine does not talk to flash
//! directly; it consumes a block device described by a [`Geometry`] and
//! driven through the [`BlockDevice`] trait. The device presents the
//! storage as `block_count` erase blocks of `block_size` bytes each,
//! readable at `read_size` granularity and programmable at `prog_size`
//! granularity after an erase.
//!
//! The adapter crate implements this trait over a reserved region of raw
//! NOR flash; engines and test fixtures implement it over whatever backing
//! store suits them.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use core::fmt;

/// Default littlefs-style lookahead buffer size in bytes.
pub const DEFAULT_LOOKAHEAD_SIZE: u32 = 32;

/// Default erase-cycle budget per block before the engine rotates it.
pub const DEFAULT_BLOCK_CYCLES: u32 = 500;

/// A validated index of one erase block within the device.
///
/// Prevents mixing block indices with byte offsets or physical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIndex(u32);

impl BlockIndex {
    /// Create a new block index.
    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the underlying u32 value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({})", self.0)
    }
}

impl From<u32> for BlockIndex {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<BlockIndex> for u32 {
    fn from(index: BlockIndex) -> Self {
        index.value()
    }
}

/// Block device configuration handed to the filesystem engine.
///
/// Describes the storage in the engine's units: read granularity, program
/// granularity (the physical page size), erase block size (the physical
/// sector size), block count, cache sizing, lookahead sizing and the
/// erase-cycle budget that drives wear-leveling rotation.
///
/// A `Geometry` is validated on construction and immutable afterwards;
/// a mounted filesystem keeps it for the life of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    read_size: u32,
    prog_size: u32,
    block_size: u32,
    block_count: u32,
    cache_size: u32,
    lookahead_size: u32,
    block_cycles: u32,
}

impl Geometry {
    /// Create a geometry with byte-granular reads and default cache,
    /// lookahead and erase-cycle sizing.
    ///
    /// `prog_size` must be the physical program page size and `block_size`
    /// the physical erase sector size. The cache defaults to a quarter of
    /// the block (never below one program page).
    ///
    /// # Errors
    ///
    /// Returns a [`GeometryError`] describing the first violated invariant.
    pub fn new(prog_size: u32, block_size: u32, block_count: u32) -> Result<Self, GeometryError> {
        let cache_size = if block_size / 4 > prog_size {
            block_size / 4
        } else {
            prog_size
        };
        Self::custom(
            1,
            prog_size,
            block_size,
            block_count,
            cache_size,
            DEFAULT_LOOKAHEAD_SIZE,
            DEFAULT_BLOCK_CYCLES,
        )
    }

    /// Create a geometry with every field chosen by the caller.
    ///
    /// # Errors
    ///
    /// Returns a [`GeometryError`] describing the first violated invariant.
    pub fn custom(
        read_size: u32,
        prog_size: u32,
        block_size: u32,
        block_count: u32,
        cache_size: u32,
        lookahead_size: u32,
        block_cycles: u32,
    ) -> Result<Self, GeometryError> {
        let geometry = Self {
            read_size,
            prog_size,
            block_size,
            block_count,
            cache_size,
            lookahead_size,
            block_cycles,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Re-check every geometry invariant.
    ///
    /// Constructors already run this; mount runs it once more so that an
    /// invalid configuration is rejected before any physical access.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.block_count == 0 {
            return Err(GeometryError::ZeroBlockCount);
        }
        if self.read_size == 0 || self.prog_size == 0 || self.block_size == 0 {
            return Err(GeometryError::ZeroGranularity);
        }
        if self.prog_size % self.read_size != 0 {
            return Err(GeometryError::ProgramNotMultipleOfRead {
                prog_size: self.prog_size,
                read_size: self.read_size,
            });
        }
        if self.block_size % self.prog_size != 0 {
            return Err(GeometryError::BlockNotMultipleOfProgram {
                block_size: self.block_size,
                prog_size: self.prog_size,
            });
        }
        if self.cache_size == 0
            || self.cache_size % self.read_size != 0
            || self.cache_size % self.prog_size != 0
            || self.block_size % self.cache_size != 0
        {
            return Err(GeometryError::InvalidCacheSize {
                cache_size: self.cache_size,
            });
        }
        if self.lookahead_size == 0 {
            return Err(GeometryError::ZeroLookahead);
        }
        Ok(())
    }

    /// Minimum read granularity in bytes.
    #[inline]
    pub const fn read_size(&self) -> u32 {
        self.read_size
    }

    /// Program granularity in bytes (the physical page size).
    #[inline]
    pub const fn prog_size(&self) -> u32 {
        self.prog_size
    }

    /// Erase block size in bytes (the physical sector size).
    #[inline]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of erase blocks in the device.
    #[inline]
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Engine cache size in bytes.
    #[inline]
    pub const fn cache_size(&self) -> u32 {
        self.cache_size
    }

    /// Engine lookahead buffer size in bytes.
    #[inline]
    pub const fn lookahead_size(&self) -> u32 {
        self.lookahead_size
    }

    /// Erase cycles per block before wear-leveling rotation.
    #[inline]
    pub const fn block_cycles(&self) -> u32 {
        self.block_cycles
    }

    /// Total device size in bytes.
    #[inline]
    pub const fn total_size(&self) -> u64 {
        self.block_count as u64 * self.block_size as u64
    }

    /// Whether `index` addresses a block inside the device.
    #[inline]
    pub const fn contains(&self, index: BlockIndex) -> bool {
        index.value() < self.block_count
    }
}

/// Errors that can occur when creating a [`Geometry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// Block count is zero.
    ZeroBlockCount,
    /// Read, program or block size is zero.
    ZeroGranularity,
    /// Program size is not a multiple of the read size.
    ProgramNotMultipleOfRead {
        /// The requested program size.
        prog_size: u32,
        /// The read size.
        read_size: u32,
    },
    /// Block size is not a multiple of the program size.
    BlockNotMultipleOfProgram {
        /// The block size.
        block_size: u32,
        /// The requested program size.
        prog_size: u32,
    },
    /// Cache size is zero, does not divide the block size, or is not a
    /// multiple of the read and program sizes.
    InvalidCacheSize {
        /// The requested cache size.
        cache_size: u32,
    },
    /// Lookahead buffer size is zero.
    ZeroLookahead,
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroBlockCount => write!(f, "Block count cannot be zero"),
            Self::ZeroGranularity => write!(f, "Read, program and block sizes must be non-zero"),
            Self::ProgramNotMultipleOfRead {
                prog_size,
                read_size,
            } => write!(
                f,
                "Program size {} must be a multiple of read size {}",
                prog_size, read_size
            ),
            Self::BlockNotMultipleOfProgram {
                block_size,
                prog_size,
            } => write!(
                f,
                "Block size {} must be a multiple of program size {}",
                block_size, prog_size
            ),
            Self::InvalidCacheSize { cache_size } => write!(
                f,
                "Cache size {} must divide the block size and be a multiple of the read and program sizes",
                cache_size
            ),
            Self::ZeroLookahead => write!(f, "Lookahead size cannot be zero"),
        }
    }
}

impl core::error::Error for GeometryError {}

/// The four operations a flash filesystem engine needs from its storage.
///
/// `read` takes `&self`: flash reads are non-destructive and implementations
/// are expected to serve them from a cached or memory-mapped read path.
/// `program` and `erase` mutate the medium. The engine guarantees
/// erase-before-program ordering; implementations do not re-verify it.
///
/// Implementations must not acquire the filesystem lock inside these
/// operations. They are only reachable from the engine, which already
/// holds it.
pub trait BlockDevice {
    /// Error type for device operations.
    type Error: core::error::Error;

    /// The geometry this device was built with.
    fn geometry(&self) -> &Geometry;

    /// Read `buf.len()` bytes starting at `offset` within `block`.
    ///
    /// Preconditions: `block` is inside the device and
    /// `offset + buf.len() <= block_size`.
    fn read(&self, block: BlockIndex, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Program `buf.len()` bytes starting at `offset` within `block`.
    ///
    /// Preconditions as for `read`, plus `offset` and `buf.len()` must be
    /// multiples of the program size. The target range must have been
    /// erased since it was last programmed; programming unerased flash
    /// yields undefined bit values.
    fn program(&mut self, block: BlockIndex, offset: u32, buf: &[u8]) -> Result<(), Self::Error>;

    /// Erase exactly one block.
    fn erase(&mut self, block: BlockIndex) -> Result<(), Self::Error>;

    /// Flush any buffered state to the medium.
    ///
    /// Devices whose program and erase are synchronous implement this as a
    /// successful no-op.
    fn sync(&mut self) -> Result<(), Self::Error>;
}
