use lazy_static::lazy_static;

use crate::{
    error::{Error, Result},
    features::Cached,
    shadow::ShadowMemory,
    write_watch::{soft_dirty::SoftDirtyWriteWatch, WriteWatch},
};

use super::{Feature, FeatureAvailability};

/// Checks that a write after a soft-dirty reset is visible in the pagemap.
///
/// The check resets soft-dirty state for the whole process.
pub struct SoftDirtyFeature;

impl SoftDirtyFeature {
    fn check(&self) -> Result<()> {
        let watch = SoftDirtyWriteWatch;
        let page = ShadowMemory::allocate(1)?;

        unsafe { std::ptr::write_volatile(page.as_ptr(), 1) };
        watch.reset(page.address_range())?;

        if !watch.written_pages(page.address_range())?.is_empty() {
            return Err(Error::NotSupported("soft-dirty reset".to_owned()));
        }

        unsafe { std::ptr::write_volatile(page.as_ptr(), 2) };

        if watch.written_pages(page.address_range())? != [0] {
            return Err(Error::NotSupported("soft-dirty tracking".to_owned()));
        }

        Ok(())
    }
}

impl Feature for SoftDirtyFeature {
    fn name(&self) -> String {
        "write-watch: soft-dirty".to_owned()
    }

    fn is_available(&self) -> FeatureAvailability {
        self.check().into()
    }
}

lazy_static! {
    pub static ref SOFT_DIRTY_FEATURE: Cached<SoftDirtyFeature> = Cached::new(SoftDirtyFeature);
}
