use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    InvalidArgs(String),
    NoEntropy(String),
    /// The registry could not produce a generator for the requested name.
    AllocationFailed(String),
    SeedFailed(String),
    GenerateFailed(String),
    /// Destination memory was not accessible and nothing was delivered.
    Fault,
    /// The shared default generator is still referenced.
    Busy,
    /// Algorithm registration refused.
    Rejected(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidArgs(msg) => write!(f, "invalid arguments: {}", msg),
            Error::NoEntropy(msg) => write!(f, "entropy error: {}", msg),
            Error::AllocationFailed(msg) => write!(f, "rng allocation failed: {}", msg),
            Error::SeedFailed(msg) => write!(f, "rng seeding failed: {}", msg),
            Error::GenerateFailed(msg) => write!(f, "rng generate failed: {}", msg),
            Error::Fault => write!(f, "bad address"),
            Error::Busy => write!(f, "default rng is busy"),
            Error::Rejected(msg) => write!(f, "registration rejected: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let msg = format!("{}", err);
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_display_rng_failures() {
        let msg = format!("{}", Error::AllocationFailed("stdrng".into()));
        assert!(msg.contains("allocation failed"));
        assert!(msg.contains("stdrng"));

        let msg = format!("{}", Error::SeedFailed("short read".into()));
        assert!(msg.contains("seeding failed"));

        let msg = format!("{}", Error::GenerateFailed("too large".into()));
        assert!(msg.contains("generate failed"));
        assert!(msg.contains("too large"));
    }

    #[test]
    fn test_display_fault_and_busy() {
        assert_eq!(format!("{}", Error::Fault), "bad address");
        assert_eq!(format!("{}", Error::Busy), "default rng is busy");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            _ => panic!("expected Error::Io"),
        }
    }
}
