#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("std::io error: `{0}`")]
    StdIO(#[from] std::io::Error),
    #[cfg(unix)]
    #[error("nix error: `{0}`")]
    Nix(#[from] nix::errno::Errno),
    #[cfg(target_os = "linux")]
    #[error("Proc error: `{0}`")]
    Proc(#[from] procfs::ProcError),
    #[cfg(windows)]
    #[error("Windows error: `{0}`")]
    Windows(#[from] windows::core::Error),

    #[error("Memory region {0:#x} is already registered")]
    AlreadyRegistered(u64),
    #[error("Invalid argument: `{0}`")]
    InvalidArgument(&'static str),
    #[error("Failed to allocate {0} bytes of shadow memory")]
    AllocationFailed(usize),
    #[error("Not supported: `{0}`")]
    NotSupported(String),

    #[error("Other error")]
    Other,
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait IgnoreNotSupportedErrorExt {
    fn ignore_not_supported_error(self) -> Self;
}

impl IgnoreNotSupportedErrorExt for Result<()> {
    fn ignore_not_supported_error(self) -> Self {
        self.map_or_else(
            |e| match e {
                Error::NotSupported(_) => Ok(()),
                e => Err(e),
            },
            |x| Ok(x),
        )
    }
}
