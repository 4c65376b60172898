use std::ops::Range;

use super::{ResetScope, WriteWatch};
use crate::error::{Error, Result};

/// Backend for hosts without a write-watch capability. Every query fails, so
/// in-place regions are reported fully dirty.
pub struct NullWriteWatch;

impl WriteWatch for NullWriteWatch {
    fn name(&self) -> &'static str {
        "none"
    }

    fn reset_scope(&self) -> ResetScope {
        ResetScope::Range
    }

    fn written_pages(&self, _range: Range<usize>) -> Result<Vec<usize>> {
        Err(Error::NotSupported("write-watch".to_owned()))
    }

    fn reset(&self, _range: Range<usize>) -> Result<()> {
        Err(Error::NotSupported("write-watch".to_owned()))
    }
}
