//! Mountable flash filesystem adapter.
//!
//! norfs exposes a reserved region of raw NOR flash as a POSIX-like
//! filesystem by adapting the flash to the block-device contract a
//! log-structured filesystem engine consumes, and by wrapping the
//! engine's operation surface in a safe handle and session API.
//!
//! # Architecture
//!
//! Control flows caller → [`MountSession`] → engine → [`RegionDevice`] →
//! physical flash:
//!
//! - [`RegionDevice`] maps the engine's `(block, offset)` coordinates
//!   into a [`FlashRegion`] of any [`embedded_storage`] NOR flash driver,
//!   masking interrupts around the program and erase primitives.
//! - [`ReentrantGate`] serializes every filesystem operation across
//!   tasks and admits the engine's re-entrant lock callbacks.
//! - [`MountSession`] owns the engine, the gate and the handle tables,
//!   and exposes mount/unmount, file, directory, attribute and metadata
//!   operations with the error taxonomy of [`Error`].
//!
//! The engine itself is a black box behind the [`Engine`] trait; its
//! metadata format, wear-leveling and garbage collection are not this
//! crate's concern.
//!
//! # Example
//!
//! ```ignore
//! use norfs::{FlashRegion, Geometry, MountSession, OpenFlags, RegionDevice, Unmasked};
//!
//! let geometry = Geometry::new(PAGE, SECTOR, 64)?;
//! let region = FlashRegion::at_top_of(FLASH_SIZE, geometry)?;
//! let device = RegionDevice::new(flash, irq, region)?;
//! let engine = MyEngine::new(device);
//!
//! let fs = MountSession::mount(engine, MyTasks, true)?;
//! let file = fs.open("/boot.cfg", OpenFlags::READ_WRITE | OpenFlags::CREATE)?;
//! fs.write(&file, b"hello")?;
//! fs.close(file)?;
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

#[macro_use]
mod fmt;

pub mod device;
pub mod engine;
pub mod error;
pub mod flash;
pub mod gate;
pub mod handle;
pub mod session;

pub use device::RegionDevice;
pub use engine::{Engine, EntryType, Metadata, NAME_MAX, OpenFlags, Whence};
pub use error::{Error, Result};
pub use flash::{FlashRegion, InterruptControl, Unmasked};
#[cfg(feature = "std")]
pub use gate::StdThreads;
pub use gate::{GateGuard, LockHooks, ReentrantGate, TaskIdProvider};
pub use handle::{DirHandle, FileHandle};
pub use session::{FsStat, MountSession};

// Re-export the contract crate so users can depend on norfs alone.
pub use norfs_block_device::{BlockDevice, BlockIndex, Geometry, GeometryError};
