use std::{collections::TryReserveError, io};

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// An allocation failed. The affected container keeps its prior state,
    /// but a mutation in flight may have left the tree partially changed
    /// (see the crate docs on transactional recovery).
    OutOfMemory,
    /// Storage I/O failure or access denied.
    Io(io::Error),
    /// The on-disk structure doesn't parse: bad block size, invalid branch
    /// shape or a pointer loop.
    Corruption(#[error(not(source))] TinyStr),
    /// Block storage ran out of space.
    NoSpace,
    /// Invalid configuration or argument.
    Validation(#[error(not(source))] TinyStr),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) => i.kind(),
            Error::OutOfMemory => io::ErrorKind::OutOfMemory,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

macro_rules! corruption {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Corruption(msg.into())
    }}
}

macro_rules! validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

pub(crate) use corruption;
pub(crate) use validation;
