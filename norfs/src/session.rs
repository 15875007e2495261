//! Mount session: the single live mount and its operation surface.
//!
//! A [`MountSession`] owns the filesystem engine, the concurrency gate
//! and the handle tables. Exactly one session exists per flash region at
//! a time: construct it with [`MountSession::mount`], destroy it with
//! [`MountSession::unmount`]. Every public operation acquires the gate,
//! so calls from concurrent tasks are strictly serialized; the same gate
//! is installed as the engine's lock hooks, which is why it must be
//! re-entrant.

use core::cell::UnsafeCell;

use alloc::sync::Arc;

use norfs_block_device::Geometry;

use crate::engine::{Engine, Metadata, OpenFlags, Whence};
use crate::error::{Error, Result};
use crate::gate::{LockHooks, ReentrantGate, TaskIdProvider};
use crate::handle::{DirHandle, FileHandle, HandleTable};

/// Filesystem usage snapshot returned by [`MountSession::fs_stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    /// Erase block size in bytes.
    pub block_size: u32,
    /// Number of erase blocks in the filesystem region.
    pub block_count: u32,
    /// Blocks currently holding data.
    pub blocks_used: u32,
}

struct Inner<E: Engine> {
    engine: E,
    files: HandleTable<E::File>,
    dirs: HandleTable<E::Dir>,
}

/// The mounted filesystem.
///
/// Shared by reference between tasks; the gate inside serializes every
/// operation. Handle values returned by [`MountSession::open`] and
/// [`MountSession::dir_open`] are consumed by the matching close and
/// rejected as [`Error::BadHandle`] if they somehow outlive it.
pub struct MountSession<E: Engine, P: TaskIdProvider> {
    inner: UnsafeCell<Inner<E>>,
    gate: Arc<ReentrantGate<P>>,
}

// SAFETY: every access to `inner` happens under the gate (or through
// exclusive ownership in `unmount`), so the UnsafeCell is never aliased
// mutably. Engine state stays inside the tables and moves with them.
unsafe impl<E, P> Sync for MountSession<E, P>
where
    E: Engine + Send,
    E::File: Send,
    E::Dir: Send,
    P: TaskIdProvider,
{
}

impl<E: Engine, P: TaskIdProvider> core::fmt::Debug for MountSession<E, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Engine state is only reachable under the gate; identify the
        // session without touching it.
        f.debug_struct("MountSession").finish_non_exhaustive()
    }
}

impl<E: Engine, P: TaskIdProvider + 'static> MountSession<E, P> {
    /// Format (if requested) and mount the filesystem behind `engine`.
    ///
    /// The geometry is validated before any physical access; an invalid
    /// configuration fails with [`Error::InvalidArgument`] without the
    /// flash being touched. The gate is created here and destroyed with
    /// the session.
    pub fn mount(mut engine: E, tasks: P, format: bool) -> Result<Self> {
        engine.geometry().validate()?;

        let gate = Arc::new(ReentrantGate::new(tasks));
        if format {
            debug!("formatting filesystem");
            engine.format()?;
        }
        let hooks: Arc<dyn LockHooks> = gate.clone();
        engine.mount(hooks)?;
        debug!("filesystem mounted");

        Ok(Self {
            inner: UnsafeCell::new(Inner {
                engine,
                files: HandleTable::new(),
                dirs: HandleTable::new(),
            }),
            gate,
        })
    }

    /// Unmount the filesystem and destroy the session.
    ///
    /// Refused with [`Error::InvalidArgument`] while any file or
    /// directory handle is still open; the untouched session is handed
    /// back alongside the error so the caller can close the stragglers
    /// and retry.
    pub fn unmount(mut self) -> core::result::Result<(), (Error, Self)> {
        let inner = self.inner.get_mut();
        let live = inner.files.live() + inner.dirs.live();
        if live != 0 {
            warn!("unmount refused: {} handles still open", live);
            return Err((Error::InvalidArgument, self));
        }
        let mut inner = self.inner.into_inner();
        let result = inner.engine.unmount();
        debug!("filesystem unmounted");
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err((err, Self {
                inner: UnsafeCell::new(inner),
                gate: self.gate,
            })),
        }
    }

    /// Run `f` with exclusive access to the engine and tables.
    ///
    /// Session operations never nest inside each other through this
    /// helper: nesting would alias the `&mut` while the re-entrant gate
    /// happily admits the same task twice.
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<E>) -> Result<R>) -> Result<R> {
        let _guard = self.gate.guard()?;
        // SAFETY: the gate is held for the whole closure, so this is the
        // only live reference to `inner` (see `Sync` impl above).
        let inner = unsafe { &mut *self.inner.get() };
        f(inner)
    }

    /// Open `path` under `flags`.
    ///
    /// On engine failure nothing is allocated and no handle leaks; the
    /// engine's status code is returned as-is.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        self.with_inner(|inner| {
            inner.files.reserve()?;
            let file = inner.engine.file_open(path, flags)?;
            trace!("opened file");
            Ok(FileHandle(inner.files.insert(file)))
        })
    }

    /// Close a file, releasing the engine state and the handle slot
    /// together.
    ///
    /// The slot is released regardless of the engine's status code, which
    /// is returned to the caller; close is not retried.
    pub fn close(&self, handle: FileHandle) -> Result<()> {
        self.with_inner(|inner| {
            let file = inner.files.remove(handle.0)?;
            trace!("closed file");
            inner.engine.file_close(file)
        })
    }

    /// Read up to `buf.len()` bytes from the current position, returning
    /// the number of bytes read.
    pub fn read(&self, handle: &FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.with_inner(|inner| {
            let Inner { engine, files, .. } = inner;
            engine.file_read(files.get_mut(handle.0)?, buf)
        })
    }

    /// Write `buf` at the current position, returning the number of bytes
    /// written.
    pub fn write(&self, handle: &FileHandle, buf: &[u8]) -> Result<usize> {
        self.with_inner(|inner| {
            let Inner { engine, files, .. } = inner;
            engine.file_write(files.get_mut(handle.0)?, buf)
        })
    }

    /// Reposition the file, returning the new absolute position.
    pub fn seek(&self, handle: &FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        self.with_inner(|inner| {
            let Inner { engine, files, .. } = inner;
            engine.file_seek(files.get_mut(handle.0)?, offset, whence)
        })
    }

    /// Current absolute position of the file.
    pub fn tell(&self, handle: &FileHandle) -> Result<u64> {
        self.with_inner(|inner| {
            let Inner { engine, files, .. } = inner;
            engine.file_tell(files.get_mut(handle.0)?)
        })
    }

    /// Reposition the file to its start.
    pub fn rewind(&self, handle: &FileHandle) -> Result<()> {
        self.with_inner(|inner| {
            let Inner { engine, files, .. } = inner;
            engine.file_seek(files.get_mut(handle.0)?, 0, Whence::Set)?;
            Ok(())
        })
    }

    /// Truncate or extend the file to `size` bytes.
    pub fn truncate(&self, handle: &FileHandle, size: u64) -> Result<()> {
        self.with_inner(|inner| {
            let Inner { engine, files, .. } = inner;
            engine.file_truncate(files.get_mut(handle.0)?, size)
        })
    }

    /// Current file size in bytes.
    pub fn size(&self, handle: &FileHandle) -> Result<u64> {
        self.with_inner(|inner| {
            let Inner { engine, files, .. } = inner;
            engine.file_size(files.get_mut(handle.0)?)
        })
    }

    /// Flush buffered file state to the medium.
    pub fn flush(&self, handle: &FileHandle) -> Result<()> {
        self.with_inner(|inner| {
            let Inner { engine, files, .. } = inner;
            engine.file_sync(files.get_mut(handle.0)?)
        })
    }

    /// Remove a file or an empty directory.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.with_inner(|inner| inner.engine.remove(path))
    }

    /// Rename an entry.
    ///
    /// Atomicity across directories is inherited from the engine, not
    /// guaranteed by the session.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.with_inner(|inner| inner.engine.rename(old_path, new_path))
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.with_inner(|inner| inner.engine.mkdir(path))
    }

    /// Metadata of the entry at `path`.
    pub fn stat(&self, path: &str) -> Result<Metadata> {
        self.with_inner(|inner| inner.engine.stat(path))
    }

    /// Read the extended attribute stored under `tag` into `buf`,
    /// returning the number of bytes copied.
    pub fn getattr(&self, path: &str, tag: u8, buf: &mut [u8]) -> Result<usize> {
        self.with_inner(|inner| inner.engine.getattr(path, tag, buf))
    }

    /// Store `value` as the extended attribute under `tag`.
    pub fn setattr(&self, path: &str, tag: u8, value: &[u8]) -> Result<()> {
        self.with_inner(|inner| inner.engine.setattr(path, tag, value))
    }

    /// Remove the extended attribute stored under `tag`.
    pub fn removeattr(&self, path: &str, tag: u8) -> Result<()> {
        self.with_inner(|inner| inner.engine.removeattr(path, tag))
    }

    /// Open a directory for iteration.
    pub fn dir_open(&self, path: &str) -> Result<DirHandle> {
        self.with_inner(|inner| {
            inner.dirs.reserve()?;
            let dir = inner.engine.dir_open(path)?;
            Ok(DirHandle(inner.dirs.insert(dir)))
        })
    }

    /// Close a directory iteration.
    pub fn dir_close(&self, handle: DirHandle) -> Result<()> {
        self.with_inner(|inner| {
            let dir = inner.dirs.remove(handle.0)?;
            inner.engine.dir_close(dir)
        })
    }

    /// Yield the next entry, or `None` at the end of the directory.
    ///
    /// The sequence is finite and bounded by the entries present when the
    /// directory was opened; visibility of entries created or removed
    /// during iteration is engine-defined.
    pub fn dir_read(&self, handle: &DirHandle) -> Result<Option<Metadata>> {
        self.with_inner(|inner| {
            let Inner { engine, dirs, .. } = inner;
            engine.dir_read(dirs.get_mut(handle.0)?)
        })
    }

    /// Reposition the iteration to an offset from [`MountSession::dir_tell`].
    pub fn dir_seek(&self, handle: &DirHandle, offset: u64) -> Result<()> {
        self.with_inner(|inner| {
            let Inner { engine, dirs, .. } = inner;
            engine.dir_seek(dirs.get_mut(handle.0)?, offset)
        })
    }

    /// Opaque position of the iteration.
    pub fn dir_tell(&self, handle: &DirHandle) -> Result<u64> {
        self.with_inner(|inner| {
            let Inner { engine, dirs, .. } = inner;
            engine.dir_tell(dirs.get_mut(handle.0)?)
        })
    }

    /// Reposition the iteration to the first entry.
    pub fn dir_rewind(&self, handle: &DirHandle) -> Result<()> {
        self.with_inner(|inner| {
            let Inner { engine, dirs, .. } = inner;
            engine.dir_rewind(dirs.get_mut(handle.0)?)
        })
    }

    /// Filesystem usage snapshot.
    pub fn fs_stat(&self) -> Result<FsStat> {
        self.with_inner(|inner| {
            let block_size = inner.engine.geometry().block_size();
            let block_count = inner.engine.geometry().block_count();
            let blocks_used = inner.engine.blocks_used()?;
            Ok(FsStat {
                block_size,
                block_count,
                blocks_used,
            })
        })
    }

    /// The geometry of the mounted filesystem.
    pub fn geometry(&self) -> Result<Geometry> {
        self.with_inner(|inner| Ok(*inner.engine.geometry()))
    }
}
