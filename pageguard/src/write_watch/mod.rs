pub mod null;
#[cfg(target_os = "linux")]
pub mod soft_dirty;
#[cfg(windows)]
pub mod win32;

use std::{fmt::Debug, ops::Range};

use cfg_if::cfg_if;
use clap::ValueEnum;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum WriteWatchType {
    #[cfg(target_os = "linux")]
    SoftDirty,
    #[cfg(windows)]
    Win32,
    None,
}

impl Default for WriteWatchType {
    fn default() -> Self {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                use crate::features::{soft_dirty::SOFT_DIRTY_FEATURE, Feature};

                if SOFT_DIRTY_FEATURE.is_available().is_ok() {
                    Self::SoftDirty
                } else {
                    warn!("No write-watch backend available, in-place regions will be reported fully dirty");
                    Self::None
                }
            } else if #[cfg(windows)] {
                Self::Win32
            } else {
                warn!("No write-watch backend available, in-place regions will be reported fully dirty");
                Self::None
            }
        }
    }
}

impl WriteWatchType {
    pub fn build(self) -> Box<dyn WriteWatch> {
        match self {
            #[cfg(target_os = "linux")]
            WriteWatchType::SoftDirty => Box::new(soft_dirty::SoftDirtyWriteWatch),
            #[cfg(windows)]
            WriteWatchType::Win32 => Box::new(win32::Win32WriteWatch),
            WriteWatchType::None => Box::new(null::NullWriteWatch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// `written_pages` resets the queried range as it reads it.
    Range,
    /// `reset` forgets writes everywhere in the process.
    Process,
}

/// Reports which pages of a range were written without trapping accesses.
pub trait WriteWatch: Send + Sync {
    fn name(&self) -> &'static str;

    fn reset_scope(&self) -> ResetScope;

    /// Indices, relative to `range.start`, of the pages written since the last
    /// reset. `range.start` is page-aligned.
    fn written_pages(&self, range: Range<usize>) -> Result<Vec<usize>>;

    /// Establishes a new baseline for `range`, or for the whole process for
    /// [`ResetScope::Process`] backends.
    fn reset(&self, range: Range<usize>) -> Result<()>;
}

impl Debug for dyn WriteWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WriteWatch({})", self.name())
    }
}
