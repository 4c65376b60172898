use std::ptr::NonNull;

use lazy_static::lazy_static;

use crate::{
    config::PageGuardConfig,
    error::{Error, Result},
    features::Cached,
    manager::PageGuardManager,
};

use super::{Feature, FeatureAvailability};

const CHECK_MEMORY_ID: u64 = u64::MAX;

/// Round-trips one write through a guarded shadow page.
pub struct FaultTrapFeature;

impl FaultTrapFeature {
    fn check(&self) -> Result<()> {
        let manager = PageGuardManager::new(PageGuardConfig::default());
        let mut backing = vec![0u8; 64];
        let mapped = NonNull::new(backing.as_mut_ptr()).ok_or(Error::Other)?;

        let effective = unsafe { manager.add_memory(CHECK_MEMORY_ID, mapped, backing.len())? };

        if effective == mapped {
            return Err(Error::NotSupported("shadow memory guard".to_owned()));
        }

        unsafe { std::ptr::write_volatile(effective.as_ptr().add(7), 0x5a) };

        let mut nr_ranges = 0;
        manager.process_memory_entry(CHECK_MEMORY_ID, |_| nr_ranges += 1)?;
        manager.remove_memory(CHECK_MEMORY_ID);

        if nr_ranges != 1 || backing[7] != 0x5a {
            return Err(Error::NotSupported("guard fault delivery".to_owned()));
        }

        Ok(())
    }
}

impl Feature for FaultTrapFeature {
    fn name(&self) -> String {
        "dirty page tracking: guard faults".to_owned()
    }

    fn is_available(&self) -> FeatureAvailability {
        self.check().into()
    }
}

lazy_static! {
    pub static ref FAULT_TRAP_FEATURE: Cached<FaultTrapFeature> = Cached::new(FaultTrapFeature);
}
