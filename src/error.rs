//! Error taxonomy.
//!
//! Failures carry opaque names inside the crate; the numeric host-OS codes
//! only appear at the hypercall boundary, where [`Error::mux`] packs a result
//! into the register convention.

use core::fmt;

/// One value per failure class the hypercall surface can report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Bad magic, misaligned handle, out-of-range length, malformed header.
    InvalidArgument,
    /// Guest handle inaccessible or page-mapping failure.
    MemoryFault,
    /// Internal allocation failed.
    OutOfMemory,
    /// Ring identity not registered.
    NotFound,
    /// Duplicate registration.
    AlreadyExists,
    /// Destination domain absent, destination ring absent, or rule rejected.
    Refused,
    /// Destination ring full; a pending entry has been queued as a side effect.
    WouldBlock,
    /// Scatter total exceeds ring capacity or the 2 GiB limit.
    MsgTooLarge,
    /// Caller has no per-domain state.
    NoDevice,
    /// Unknown opcode.
    Unsupported,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Host-OS numeric code for this error.
    pub const fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument => 22, // EINVAL
            Error::MemoryFault => 14,     // EFAULT
            Error::OutOfMemory => 12,     // ENOMEM
            Error::NotFound => 2,         // ENOENT
            Error::AlreadyExists => 17,   // EEXIST
            Error::Refused => 111,        // ECONNREFUSED
            Error::WouldBlock => 11,      // EAGAIN
            Error::MsgTooLarge => 90,     // EMSGSIZE
            Error::NoDevice => 19,        // ENODEV
            Error::Unsupported => 38,     // ENOSYS
        }
    }

    const fn from_errno(errno: i32) -> Option<Error> {
        Some(match errno {
            22 => Error::InvalidArgument,
            14 => Error::MemoryFault,
            12 => Error::OutOfMemory,
            2 => Error::NotFound,
            17 => Error::AlreadyExists,
            111 => Error::Refused,
            11 => Error::WouldBlock,
            90 => Error::MsgTooLarge,
            19 => Error::NoDevice,
            38 => Error::Unsupported,
            _ => return None,
        })
    }

    /// Packs a result into the hypercall return register: the value itself on
    /// success, the negated errno on failure.
    pub fn mux(result: Result<usize>) -> isize {
        match result {
            Ok(value) => value as isize,
            Err(error) => -(error.errno() as isize),
        }
    }

    /// Inverse of [`Error::mux`]. Unrecognized negative codes decode to
    /// [`Error::Unsupported`].
    pub fn demux(value: isize) -> Result<usize> {
        if value >= 0 {
            Ok(value as usize)
        } else {
            Err(Error::from_errno(-value as i32).unwrap_or(Error::Unsupported))
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Error::InvalidArgument => "invalid argument",
            Error::MemoryFault => "memory fault",
            Error::OutOfMemory => "out of memory",
            Error::NotFound => "not found",
            Error::AlreadyExists => "already exists",
            Error::Refused => "refused",
            Error::WouldBlock => "would block",
            Error::MsgTooLarge => "message too large",
            Error::NoDevice => "no device",
            Error::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}
