//! Contract between the adapter and the log-structured filesystem engine.
//!
//! The engine is a black box: it owns the block device handed to it at
//! construction, lays out its own metadata, performs wear-leveling and
//! garbage collection internally, and guarantees erase-before-program
//! ordering on every block it touches. The adapter only relies on the
//! operation surface below and on the engine bracketing its re-entrant
//! internal call chains with the [`LockHooks`] installed at mount.
//!
//! Engine status codes pass through the adapter unrenamed; see
//! [`crate::error::Error`].

use alloc::sync::Arc;

use bitflags::bitflags;
use norfs_block_device::Geometry;

use crate::error::Result;
use crate::gate::LockHooks;

/// Longest entry name the engine stores, excluding any terminator.
pub const NAME_MAX: usize = 255;

bitflags! {
    /// File open flags.
    ///
    /// Create/read/write/append/truncate semantics are defined by the
    /// engine; the values mirror the conventional littlefs encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 0x0001;
        /// Open for writing.
        const WRITE = 0x0002;
        /// Open for reading and writing.
        const READ_WRITE = 0x0003;
        /// Create the file if it does not exist.
        const CREATE = 0x0100;
        /// Fail if the file already exists.
        const EXCLUSIVE = 0x0200;
        /// Truncate the existing file to zero size.
        const TRUNCATE = 0x0400;
        /// Move to the end of the file on every write.
        const APPEND = 0x0800;
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Whence {
    /// Relative to the start of the file.
    Set,
    /// Relative to the current position.
    Current,
    /// Relative to the end of the file.
    End,
}

/// Entry type reported by stat and directory reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EntryType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// Entry metadata: type, size and name.
///
/// The name is bounded by [`NAME_MAX`] and owned by the metadata value,
/// so callers never copy into a buffer whose size they must guess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Whether the entry is a file or a directory.
    pub entry_type: EntryType,
    /// Entry size in bytes. Only meaningful for files.
    pub size: u32,
    /// Entry name.
    pub name: heapless::String<NAME_MAX>,
}

/// Operation surface of the log-structured filesystem engine.
///
/// One engine instance manages one mounted filesystem over the block
/// device it owns. All methods take `&mut self`; serialization across
/// tasks is the mount session's job, re-entrant bracketing inside a task
/// is the engine's (through the hooks given to [`Engine::mount`]).
///
/// File and directory state types are engine-internal; callers only see
/// the opaque handles the session wraps them in.
pub trait Engine {
    /// Engine-internal state of an open file.
    type File;
    /// Engine-internal state of an open directory iteration.
    type Dir;

    /// Write a fresh, empty filesystem onto the block device.
    fn format(&mut self) -> Result<()>;

    /// Mount the filesystem, installing `hooks` as the lock callbacks the
    /// engine invokes around its top-level and re-entrant call chains.
    fn mount(&mut self, hooks: Arc<dyn LockHooks>) -> Result<()>;

    /// Unmount the filesystem. The engine must not touch the device
    /// afterwards until mounted again.
    fn unmount(&mut self) -> Result<()>;

    /// Open `path` under `flags`, returning the populated file state.
    fn file_open(&mut self, path: &str, flags: OpenFlags) -> Result<Self::File>;

    /// Close a file, releasing all engine state behind it.
    fn file_close(&mut self, file: Self::File) -> Result<()>;

    /// Read up to `buf.len()` bytes at the current position.
    fn file_read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at the current position (or the end under append).
    fn file_write(&mut self, file: &mut Self::File, buf: &[u8]) -> Result<usize>;

    /// Reposition the file, returning the new absolute position.
    fn file_seek(&mut self, file: &mut Self::File, offset: i64, whence: Whence) -> Result<u64>;

    /// Current absolute position.
    fn file_tell(&mut self, file: &mut Self::File) -> Result<u64>;

    /// Truncate or extend the file to `size` bytes.
    fn file_truncate(&mut self, file: &mut Self::File, size: u64) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&mut self, file: &mut Self::File) -> Result<u64>;

    /// Flush buffered file state to the medium.
    fn file_sync(&mut self, file: &mut Self::File) -> Result<()>;

    /// Remove a file or an empty directory.
    fn remove(&mut self, path: &str) -> Result<()>;

    /// Rename an entry. Atomicity across directories is engine-defined.
    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()>;

    /// Create a directory.
    fn mkdir(&mut self, path: &str) -> Result<()>;

    /// Metadata of the entry at `path`.
    fn stat(&mut self, path: &str) -> Result<Metadata>;

    /// Read the attribute stored under `tag` into `buf`, returning the
    /// number of bytes copied. Truncation to `buf.len()` is
    /// engine-defined.
    fn getattr(&mut self, path: &str, tag: u8, buf: &mut [u8]) -> Result<usize>;

    /// Store `value` as the attribute under `tag`, replacing any previous
    /// value.
    fn setattr(&mut self, path: &str, tag: u8, value: &[u8]) -> Result<()>;

    /// Remove the attribute stored under `tag`.
    fn removeattr(&mut self, path: &str, tag: u8) -> Result<()>;

    /// Open a directory for iteration.
    fn dir_open(&mut self, path: &str) -> Result<Self::Dir>;

    /// Close a directory iteration.
    fn dir_close(&mut self, dir: Self::Dir) -> Result<()>;

    /// Yield the next entry, or `None` at the end of the directory.
    fn dir_read(&mut self, dir: &mut Self::Dir) -> Result<Option<Metadata>>;

    /// Reposition the iteration to an offset obtained from
    /// [`Engine::dir_tell`].
    fn dir_seek(&mut self, dir: &mut Self::Dir, offset: u64) -> Result<()>;

    /// Opaque position of the iteration.
    fn dir_tell(&mut self, dir: &mut Self::Dir) -> Result<u64>;

    /// Reposition the iteration to the first entry.
    fn dir_rewind(&mut self, dir: &mut Self::Dir) -> Result<()>;

    /// The geometry the engine was configured with.
    fn geometry(&self) -> &Geometry;

    /// Number of blocks currently holding data, for usage accounting.
    fn blocks_used(&mut self) -> Result<u32>;
}
