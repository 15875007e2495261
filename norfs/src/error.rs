//! Error kinds surfaced to filesystem callers.

use core::fmt;

use norfs_block_device::GeometryError;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by the filesystem engine and the adapter around it.
///
/// Engine-reported kinds pass through the adapter unrenamed. The adapter
/// itself only ever produces two of them: [`Error::OutOfMemory`] when a
/// handle table cannot grow, and [`Error::Io`] when the concurrency gate
/// or a physical flash primitive fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Error during a device or lock operation.
    Io,
    /// On-flash metadata failed the engine's integrity checks.
    Corrupt,
    /// No directory entry with that name.
    NotFound,
    /// Entry already exists.
    AlreadyExists,
    /// Entry is not a directory.
    NotADirectory,
    /// Entry is a directory.
    IsADirectory,
    /// Directory is not empty.
    DirectoryNotEmpty,
    /// Handle is stale or was already closed.
    BadHandle,
    /// File exceeds the engine's maximum file size.
    FileTooLarge,
    /// Invalid parameter.
    InvalidArgument,
    /// No space left on device.
    NoSpace,
    /// No more memory available.
    OutOfMemory,
    /// No attribute stored under the requested tag.
    NoAttribute,
    /// Entry name exceeds the name length limit.
    NameTooLong,
}

impl Error {
    /// Fixed diagnostic string for this error kind.
    ///
    /// Diagnostic only — callers branch on the kind itself, never on this
    /// text.
    pub const fn message(self) -> &'static str {
        match self {
            Error::Io => "Error during device operation",
            Error::Corrupt => "Corrupted",
            Error::NotFound => "No directory entry",
            Error::AlreadyExists => "Entry already exists",
            Error::NotADirectory => "Entry is not a dir",
            Error::IsADirectory => "Entry is a dir",
            Error::DirectoryNotEmpty => "Dir is not empty",
            Error::BadHandle => "Bad file number",
            Error::FileTooLarge => "File too large",
            Error::InvalidArgument => "Invalid parameter",
            Error::NoSpace => "No space left on device",
            Error::OutOfMemory => "No more memory available",
            Error::NoAttribute => "No data/attr available",
            Error::NameTooLong => "File name too long",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl core::error::Error for Error {}

impl From<GeometryError> for Error {
    fn from(_: GeometryError) -> Self {
        Error::InvalidArgument
    }
}
