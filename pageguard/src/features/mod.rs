pub mod fault_trap;
#[cfg(target_os = "linux")]
pub mod soft_dirty;

use std::fmt::Display;

use colored::Colorize;
use lazy_init::Lazy;
use lazy_static::lazy_static;

use crate::error::Error;

use self::fault_trap::FAULT_TRAP_FEATURE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureAvailability {
    Ok,
    RequiresPrivilege,
    Unavailable,
}

impl Display for FeatureAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureAvailability::Ok => "ok".green().fmt(f),
            FeatureAvailability::RequiresPrivilege => "requires privilege".yellow().fmt(f),
            FeatureAvailability::Unavailable => "unavailable".red().fmt(f),
        }
    }
}

impl<T> From<crate::error::Result<T>> for FeatureAvailability {
    fn from(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(_) => FeatureAvailability::Ok,
            #[cfg(unix)]
            Err(Error::Nix(nix::errno::Errno::EPERM)) => FeatureAvailability::RequiresPrivilege,
            Err(Error::StdIO(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                FeatureAvailability::RequiresPrivilege
            }
            Err(_) => FeatureAvailability::Unavailable,
        }
    }
}

impl FeatureAvailability {
    pub fn is_ok(&self) -> bool {
        self == &FeatureAvailability::Ok
    }
}

pub trait Feature: Sync {
    fn name(&self) -> String;
    fn is_available(&self) -> FeatureAvailability;
}

/// Runs the wrapped check once and remembers the answer.
pub struct Cached<T: Feature> {
    inner: T,
    avail: Lazy<FeatureAvailability>,
}

impl<T: Feature> Cached<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            avail: Lazy::new(),
        }
    }
}

impl<T: Feature> Feature for Cached<T> {
    fn is_available(&self) -> FeatureAvailability {
        *self.avail.get_or_create(|| self.inner.is_available())
    }

    fn name(&self) -> String {
        self.inner.name()
    }
}

lazy_static! {
    pub static ref FEATURES: Vec<&'static dyn Feature> = vec![
        &*FAULT_TRAP_FEATURE,
        #[cfg(target_os = "linux")]
        &*soft_dirty::SOFT_DIRTY_FEATURE,
    ];
}

/// Lines of the form `<name>: <availability>`, one per known feature.
pub fn feature_report() -> Vec<String> {
    FEATURES
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.is_available()))
        .collect()
}

pub fn show_features() {
    for line in feature_report() {
        println!("{line}");
    }
}
