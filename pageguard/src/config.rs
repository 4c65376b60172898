use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Process-wide tracking options, fixed when a [`PageGuardManager`](crate::PageGuardManager)
/// is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(default, pattern = "owned")]
#[serde(default)]
pub struct PageGuardConfig {
    /// Substitute a private, protected buffer for each mapping and trap the
    /// first access of every page. When off, writes are discovered through the
    /// platform write-watch backend at drain time.
    pub enable_shadow_memory: bool,

    /// Copy the mapping's current contents into the shadow buffer.
    pub enable_copy_on_map: bool,

    /// Defer the copy-on-map of each page until that page is first accessed.
    /// Has no effect unless `enable_copy_on_map` is set.
    pub enable_lazy_copy: bool,

    /// Record read faults separately from write faults. Only honoured by fault
    /// sources that can tell the two apart.
    pub enable_separate_read_tracking: bool,

    /// Pages are expected to be both read and written, so a read fault also
    /// marks the page as written.
    pub enable_read_write_same_page: bool,
}

impl Default for PageGuardConfig {
    fn default() -> Self {
        Self {
            enable_shadow_memory: true,
            enable_copy_on_map: true,
            enable_lazy_copy: false,
            enable_separate_read_tracking: false,
            enable_read_write_same_page: true,
        }
    }
}

impl PageGuardConfig {
    pub fn from_yaml_reader(reader: impl std::io::Read) -> Result<Self> {
        serde_yaml::from_reader(reader).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()).into()
        })
    }

    pub fn uses_lazy_copy(&self) -> bool {
        self.enable_copy_on_map && self.enable_lazy_copy
    }

    pub fn uses_eager_copy(&self) -> bool {
        self.enable_copy_on_map && !self.enable_lazy_copy
    }
}

impl PageGuardConfigBuilder {
    /// Shadow memory disabled; dirty pages come from the write-watch backend.
    pub fn direct() -> Self {
        Self::default().enable_shadow_memory(false)
    }
}
