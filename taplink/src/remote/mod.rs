//! The remote wire protocol: a line-based ASCII protocol re-exporting the
//! tap, ADIv5 and RISC-V DMI primitives over a serial link.
//!
//! A deployment has two halves: the firmware side runs a
//! [`RemoteServer`] over its local drivers, the hosted side drives a
//! [`RemoteProbe`] that implements the same tap traits the local drivers
//! do, so the entire ADI stack runs unchanged on either end of the cable.

pub mod probe;
pub mod protocol;
pub mod server;

pub use probe::{RemoteLink, RemoteProbe};
pub use protocol::{ProtocolVersion, ResponseCode};
pub use server::{RemoteBackend, RemoteServer};

/// An error on the remote link.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// A frame failed to parse.
    #[error("malformed remote packet")]
    Protocol,
    /// The remote end replied with an error code.
    #[error("remote reported error {0:#04x}")]
    Remote(u8),
    /// The remote end does not implement the request.
    #[error("operation not supported by the remote")]
    NotSupported,
    /// The transport timed out waiting for a response.
    #[error("remote link timed out")]
    Timeout,
    /// The transport itself failed.
    #[error("remote link I/O failed: {0}")]
    Io(String),
}
