use std::{ffi::c_void, sync::Arc};

use lazy_static::lazy_static;
use log::{debug, error};
use parking_lot::RwLock;
use windows::Win32::{
    Foundation::{STATUS_ACCESS_VIOLATION, STATUS_GUARD_PAGE_VIOLATION},
    System::Diagnostics::Debug::{
        AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, EXCEPTION_POINTERS,
    },
};

use super::{FaultAccess, FaultResolver, FaultSource, GuardFault, HookId, HookTable};
use crate::error::{Error, Result};

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

struct ExceptionHooks {
    table: HookTable,
    // Opaque handle returned by AddVectoredExceptionHandler.
    handle: usize,
}

lazy_static! {
    static ref HOOKS: RwLock<ExceptionHooks> = RwLock::new(ExceptionHooks {
        table: HookTable::new(),
        handle: 0,
    });
}

/// Delivers protection faults through a first-chance vectored exception
/// handler.
///
/// Guard-page exceptions clear the guard themselves; access violations on
/// read-only pages do not.
pub struct ExceptionFaultSource;

impl FaultSource for ExceptionFaultSource {
    fn name(&self) -> &'static str {
        "vectored exception"
    }

    fn reports_access_kind(&self) -> bool {
        true
    }

    fn attach(&self, resolver: Arc<dyn FaultResolver>) -> Result<HookId> {
        let mut hooks = HOOKS.write();

        if hooks.table.is_empty() {
            let handle = unsafe { AddVectoredExceptionHandler(1, Some(handle_guard_exception)) };

            if handle.is_null() {
                let e = windows::core::Error::from_win32();
                error!("Failed to register guard exception handler: {e}");
                return Err(Error::Windows(e));
            }

            debug!("Installed guard exception handler");
            hooks.handle = handle as usize;
        }

        Ok(hooks.table.insert(resolver))
    }

    fn detach(&self, hook: HookId) -> Result<()> {
        let mut hooks = HOOKS.write();

        if hooks.table.remove(hook) && hooks.table.is_empty() {
            let handle = std::mem::take(&mut hooks.handle);

            if unsafe { RemoveVectoredExceptionHandler(handle as *const c_void) } == 0 {
                let e = windows::core::Error::from_win32();
                error!("Failed to remove guard exception handler: {e}");
                return Err(Error::Windows(e));
            }

            debug!("Removed guard exception handler");
        }

        Ok(())
    }

    fn is_installed(&self) -> bool {
        !HOOKS.read().table.is_empty()
    }
}

unsafe extern "system" fn handle_guard_exception(pointers: *mut EXCEPTION_POINTERS) -> i32 {
    if pointers.is_null() || (*pointers).ExceptionRecord.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let record = &*(*pointers).ExceptionRecord;

    let guard_cleared = if record.ExceptionCode == STATUS_GUARD_PAGE_VIOLATION {
        true
    } else if record.ExceptionCode == STATUS_ACCESS_VIOLATION {
        false
    } else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    // ExceptionInformation[0] is 0 for reads, ExceptionInformation[1] is the
    // inaccessible address.
    if record.NumberParameters < 2 || record.ExceptionInformation[1] == 0 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let fault = GuardFault {
        address: record.ExceptionInformation[1],
        access: if record.ExceptionInformation[0] == 0 {
            FaultAccess::Read
        } else {
            FaultAccess::Write
        },
        guard_cleared,
    };

    if HOOKS.read().table.resolve(&fault) {
        EXCEPTION_CONTINUE_EXECUTION
    } else {
        EXCEPTION_CONTINUE_SEARCH
    }
}
