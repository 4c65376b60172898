use std::{ffi::c_void, sync::Arc};

use cfg_if::cfg_if;
use lazy_static::lazy_static;
use log::{debug, error, warn};
use nix::{
    libc,
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
};
use parking_lot::RwLock;

use super::{FaultAccess, FaultResolver, FaultSource, GuardFault, HookId, HookTable};
use crate::error::Result;

cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        // Darwin reports some protection faults as SIGBUS.
        const GUARD_SIGNALS: &[Signal] = &[Signal::SIGSEGV, Signal::SIGBUS];
    } else {
        const GUARD_SIGNALS: &[Signal] = &[Signal::SIGSEGV];
    }
}

struct SignalHooks {
    table: HookTable,
    previous: Vec<(Signal, SigAction)>,
}

lazy_static! {
    static ref HOOKS: RwLock<SignalHooks> = RwLock::new(SignalHooks {
        table: HookTable::new(),
        previous: Vec::new(),
    });
}

/// Delivers protection faults through a `SIGSEGV` handler.
///
/// Signal delivery does not tell reads from writes, so every fault is
/// reported with [`FaultAccess::Unknown`].
pub struct SignalFaultSource;

impl FaultSource for SignalFaultSource {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn reports_access_kind(&self) -> bool {
        false
    }

    fn attach(&self, resolver: Arc<dyn FaultResolver>) -> Result<HookId> {
        let mut hooks = HOOKS.write();

        if hooks.table.is_empty() {
            let action = SigAction::new(
                SigHandler::SigAction(handle_guard_fault),
                SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
                SigSet::empty(),
            );

            let mut previous = Vec::new();

            for &signal in GUARD_SIGNALS {
                match unsafe { sigaction(signal, &action) } {
                    Ok(old) => previous.push((signal, old)),
                    Err(e) => {
                        error!("Failed to register guard fault handler for {signal}: {e}");
                        restore_previous_handlers(&previous);
                        return Err(e.into());
                    }
                }
            }

            debug!("Installed guard fault handler for {:?}", GUARD_SIGNALS);
            hooks.previous = previous;
        }

        Ok(hooks.table.insert(resolver))
    }

    fn detach(&self, hook: HookId) -> Result<()> {
        let mut hooks = HOOKS.write();

        if hooks.table.remove(hook) && hooks.table.is_empty() {
            let previous = std::mem::take(&mut hooks.previous);
            restore_previous_handlers(&previous);
            debug!("Removed guard fault handler");
        }

        Ok(())
    }

    fn is_installed(&self) -> bool {
        !HOOKS.read().table.is_empty()
    }
}

fn restore_previous_handlers(previous: &[(Signal, SigAction)]) {
    for (signal, old) in previous {
        match unsafe { sigaction(*signal, old) } {
            Ok(current) => {
                if current.handler() != SigHandler::SigAction(handle_guard_fault) {
                    warn!(
                        "Guard fault handler for {signal} was replaced while tracking was active; \
                         the replacement may have treated guard faults as crashes"
                    );
                }
            }
            Err(e) => error!("Failed to restore previous handler for {signal}: {e}"),
        }
    }
}

unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }

    cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            (*info).si_addr() as usize
        } else {
            (*info).si_addr as usize
        }
    }
}

extern "C" fn handle_guard_fault(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let address = unsafe { fault_address(info) };
    let hooks = HOOKS.read();

    if address != 0 {
        let fault = GuardFault {
            address,
            access: FaultAccess::Unknown,
            guard_cleared: false,
        };

        if hooks.table.resolve(&fault) {
            return;
        }
    }

    // Not a fault on tracked memory.
    let previous = hooks
        .previous
        .iter()
        .find(|(signal, _)| *signal as libc::c_int == signum)
        .map(|(_, action)| action.handler());

    match previous {
        Some(SigHandler::SigAction(handler)) => handler(signum, info, context),
        Some(SigHandler::Handler(handler)) => handler(signum),
        _ => std::process::abort(),
    }
}
