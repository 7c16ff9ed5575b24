use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock, RwLockReadGuard,
};

use tracing::{trace, warn};

use super::MappedRegion;
use crate::error::StorageError;

/// Reference-counted ownership of one [MappedRegion].
///
/// Each open reference keeps the region mapped. Releasing the last one closes
/// the region. Reads hold the region's read lock, so teardown waits for reads
/// in progress and reads that start afterward fail with
/// [StorageError::Closed].
///
/// [open](Self::open) increments under the read lock and the final
/// [release](Self::release) decrements to zero and closes under the write
/// lock, so no reference is ever handed out for a region that is closing.
#[derive(Debug)]
pub struct MappedGuard {
    refs: AtomicUsize,
    region: RwLock<MappedRegion>,
}

impl MappedGuard {
    /// Wraps `region` in a guard with no open references.
    pub fn new(region: MappedRegion) -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicUsize::new(0),
            region: RwLock::new(region),
        })
    }

    /// Takes a reference. Fails if the region has already been closed.
    pub fn open(&self) -> Result<(), StorageError> {
        let region = self.region.read().unwrap();
        if region.is_closed() {
            return Err(StorageError::Closed("mapped region"));
        }
        let refs = self.refs.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("{}: opened reference {refs}", region.path().display());
        Ok(())
    }

    /// Drops a reference, closing the region when none remain.
    ///
    /// The count never goes below zero: releasing a guard without open
    /// references only logs a warning.
    pub fn release(&self) -> Result<(), StorageError> {
        let mut refs = self.refs.load(Ordering::Acquire);
        loop {
            match refs {
                0 => {
                    warn!("released a mapped region guard with no open references");
                    return Ok(());
                }
                1 => return self.release_last(),
                _ => match self.refs.compare_exchange(
                    refs,
                    refs - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(()),
                    Err(current) => refs = current,
                },
            }
        }
    }

    /// Releases what looked like the last reference. Opens wait for the write
    /// lock, so only releases of other references can change the count here,
    /// and those never take it from 1 to 0.
    fn release_last(&self) -> Result<(), StorageError> {
        let mut region = self.region.write().unwrap();
        let mut refs = self.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                warn!("released a mapped region guard with no open references");
                return Ok(());
            }
            match self
                .refs
                .compare_exchange(refs, refs - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(1) => return region.close(),
                Ok(_) => return Ok(()),
                Err(current) => refs = current,
            }
        }
    }

    /// Returns the number of open references.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.region.read().unwrap().is_closed()
    }

    /// Returns the length of the mapped file.
    pub fn length(&self) -> u64 {
        self.region.read().unwrap().length()
    }

    /// Locks the region for reading.
    pub fn region(&self) -> RwLockReadGuard<'_, MappedRegion> {
        self.region.read().unwrap()
    }
}
