pub mod config;
pub mod error;
pub mod fault;
pub mod features;
pub mod manager;
pub mod page;
mod platform;
pub mod protection;
pub mod registry;
pub mod shadow;
pub mod statistics;
pub mod status;
pub mod write_watch;

pub use config::{PageGuardConfig, PageGuardConfigBuilder};
pub use error::{Error, Result};
pub use manager::{ModifiedRange, PageGuardManager, PageStatus};
