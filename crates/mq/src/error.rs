use std::io;

use thiserror::Error;

/// Errors latched onto a [`crate::Connection`] when it enters the terminal
/// error state, plus the few failures that can occur before a connection
/// exists at all (`Link::serve`, `Link::connect`, `PollGroup` membership).
#[derive(Error, Debug)]
pub enum MqError {
    #[error("bad frame: magic/reserved/type-bits mismatch")]
    BadFrame,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("out of memory growing receive buffer")]
    OutOfMemory,
    #[error("connection already belongs to this poll group")]
    AlreadyMember,
    #[error("connection already belongs to a different poll group")]
    AlreadyInOtherGroup,
    #[error("connection is not a member of this poll group")]
    NotMember,
    /// Reconstructed from a connection's latched `err` code when an
    /// operation is attempted on a connection already in the `ERROR` state.
    /// The original [`MqError`] isn't kept around (`io::Error` isn't
    /// `Clone`), so only the code survives.
    #[error("connection already failed (errno {0})")]
    Latched(i32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MqError {
    /// Maps an error to the latched code `geterror` reports, 0 meaning
    /// healthy (see spec.md §7 "user-visible behavior").
    pub fn code(&self) -> i32 {
        match self {
            MqError::BadFrame => libc::EBADF,
            MqError::ConnectionReset => libc::ECONNRESET,
            MqError::OutOfMemory => libc::ENOMEM,
            MqError::AlreadyMember => libc::EEXIST,
            MqError::AlreadyInOtherGroup | MqError::NotMember => libc::EINVAL,
            MqError::Latched(code) => *code,
            MqError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
