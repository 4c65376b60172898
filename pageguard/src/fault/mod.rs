#[cfg(windows)]
pub mod exception;
#[cfg(unix)]
pub mod signal;

use std::sync::Arc;

use cfg_if::cfg_if;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    /// The platform does not say which kind of access trapped.
    Unknown,
}

/// A protection fault translated from its platform-specific record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardFault {
    pub address: usize,
    pub access: FaultAccess,
    /// The platform already removed the guard from the faulting page.
    pub guard_cleared: bool,
}

/// Decides whether a fault belongs to tracked memory and makes the faulting
/// access retryable if so.
pub trait FaultResolver: Send + Sync {
    /// Returns `true` if the fault was handled.
    fn resolve(&self, fault: &GuardFault) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl HookId {
    /// For [`FaultSource`] implementations that keep their own hook tables.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// A process-wide hook delivering protection faults to attached resolvers.
///
/// The platform handler is installed when the first resolver attaches and
/// removed, restoring whatever handler was there before, when the last one
/// detaches. Faults no resolver claims are passed on to the previous handler.
pub trait FaultSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether faults carry [`FaultAccess::Read`] / [`FaultAccess::Write`].
    fn reports_access_kind(&self) -> bool;

    fn attach(&self, resolver: Arc<dyn FaultResolver>) -> Result<HookId>;

    fn detach(&self, hook: HookId) -> Result<()>;

    fn is_installed(&self) -> bool;
}

pub fn default_fault_source() -> Box<dyn FaultSource> {
    cfg_if! {
        if #[cfg(unix)] {
            Box::new(signal::SignalFaultSource)
        } else {
            Box::new(exception::ExceptionFaultSource)
        }
    }
}

/// Resolvers attached to one platform hook.
pub(crate) struct HookTable {
    hooks: Vec<(HookId, Arc<dyn FaultResolver>)>,
    next_id: u64,
}

impl HookTable {
    pub const fn new() -> Self {
        Self {
            hooks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, resolver: Arc<dyn FaultResolver>) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.push((id, resolver));
        id
    }

    /// Returns `false` if the hook was not attached.
    pub fn remove(&mut self, id: HookId) -> bool {
        let len = self.hooks.len();
        self.hooks.retain(|(hook, _)| *hook != id);
        self.hooks.len() != len
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn resolve(&self, fault: &GuardFault) -> bool {
        self.hooks.iter().any(|(_, resolver)| resolver.resolve(fault))
    }
}
