//! Block-device adapter over a reserved NOR flash region.
//!
//! [`RegionDevice`] translates the engine's block coordinates into
//! physical flash addresses and implements the four block-device
//! operations on top of any [`embedded_storage`] NOR flash driver:
//! reads go straight to the driver's (cached/XIP) read path, program and
//! erase run under the interrupt mask, and sync is a successful no-op
//! because both destructive primitives are synchronous on the medium.

use core::cell::UnsafeCell;

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use norfs_block_device::{BlockDevice, BlockIndex, Geometry};

use crate::error::{Error, Result};
use crate::flash::{FlashRegion, InterruptControl};

/// Adapter exposing a [`FlashRegion`] of a raw NOR flash driver as a
/// [`BlockDevice`].
///
/// # Safety
///
/// This type uses `UnsafeCell` for interior mutability because
/// `embedded-storage` traits require `&mut self` for reads, but
/// [`BlockDevice::read`] takes `&self`. Access must be externally
/// serialized in multi-threaded contexts; in this crate the concurrency
/// gate provides that serialization, since block operations are only
/// reachable from the engine while it holds the lock.
pub struct RegionDevice<F, I> {
    flash: UnsafeCell<F>,
    irq: I,
    region: FlashRegion,
}

// SAFETY: RegionDevice is Send if its parts are Send; the UnsafeCell only
// adds interior mutability, not thread affinity.
unsafe impl<F: Send, I: Send> Send for RegionDevice<F, I> {}

// SAFETY: RegionDevice is Sync if its parts are Sync. Access must be
// externally serialized in multi-threaded contexts (see type docs).
unsafe impl<F: Sync, I: Sync> Sync for RegionDevice<F, I> {}

impl<F, I> RegionDevice<F, I>
where
    F: ReadNorFlash + NorFlash,
    I: InterruptControl,
{
    /// Create a device over `region` of `flash`, masking interrupts with
    /// `irq` around every program and erase.
    ///
    /// Fails with [`Error::InvalidArgument`] when the region's geometry
    /// does not agree with the driver's program/erase granularity or does
    /// not fit the part.
    pub fn new(flash: F, irq: I, region: FlashRegion) -> Result<Self> {
        let geometry = region.geometry();
        if geometry.prog_size() as usize % F::WRITE_SIZE != 0
            || geometry.block_size() as usize % F::ERASE_SIZE != 0
            || region.base() as usize % F::ERASE_SIZE != 0
        {
            return Err(Error::InvalidArgument);
        }
        if region.base() as u64 + geometry.total_size() > flash.capacity() as u64 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            flash: UnsafeCell::new(flash),
            irq,
            region,
        })
    }

    /// The flash region this device is carved from.
    pub fn region(&self) -> &FlashRegion {
        &self.region
    }

    /// Consume the device and return the underlying flash driver.
    pub fn into_inner(self) -> F {
        self.flash.into_inner()
    }

    fn check_access(&self, block: BlockIndex, offset: u32, len: usize) -> Result<()> {
        let geometry = self.region.geometry();
        if !geometry.contains(block) {
            return Err(Error::InvalidArgument);
        }
        if offset as u64 + len as u64 > geometry.block_size() as u64 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl<F, I> BlockDevice for RegionDevice<F, I>
where
    F: ReadNorFlash + NorFlash,
    I: InterruptControl,
{
    type Error = Error;

    fn geometry(&self) -> &Geometry {
        self.region.geometry()
    }

    fn read(&self, block: BlockIndex, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_access(block, offset, buf.len())?;
        let address = self.region.address_of(block.value(), offset);
        // SAFETY: callers are serialized by the filesystem lock (see type
        // docs), so no other access to the driver is live.
        let flash = unsafe { &mut *self.flash.get() };
        flash.read(address, buf).map_err(|_| Error::Io)
    }

    fn program(&mut self, block: BlockIndex, offset: u32, buf: &[u8]) -> Result<()> {
        self.check_access(block, offset, buf.len())?;
        let prog_size = self.region.geometry().prog_size();
        if offset % prog_size != 0 || buf.len() as u32 % prog_size != 0 {
            return Err(Error::InvalidArgument);
        }
        let Self { flash, irq, region } = self;
        let address = region.address_of(block.value(), offset);
        let flash = flash.get_mut();
        irq.with_masked(|| flash.write(address, buf))
            .map_err(|_| Error::Io)
    }

    fn erase(&mut self, block: BlockIndex) -> Result<()> {
        if !self.region.geometry().contains(block) {
            return Err(Error::InvalidArgument);
        }
        let Self { flash, irq, region } = self;
        let block_size = region.geometry().block_size();
        let address = region.address_of(block.value(), 0);
        let flash = flash.get_mut();
        irq.with_masked(|| flash.erase(address, address + block_size))
            .map_err(|_| Error::Io)
    }

    fn sync(&mut self) -> Result<()> {
        // Program and erase are synchronous on the medium.
        Ok(())
    }
}
