#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error("busy")]
    Busy,
    #[error("bad state or corrupt descriptor")]
    BadState,
    #[error("capacity exhausted")]
    NoSpace,
    #[error("not ready")]
    NotReady,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
