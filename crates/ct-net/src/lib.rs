//! ---
//! ct_section: "05-networking-external-interfaces"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Network connectivity for table applications."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! TCP transport for the coffee table service.
//!
//! Every frame is a 4-byte little-endian length followed by one UTF-8 JSON
//! message envelope.
#![warn(missing_docs)]

pub mod frame;
pub mod tcp;

/// Errors raised by the network layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// A peer announced a frame above the configured limit.
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Announced frame length.
        length: usize,
        /// Configured maximum.
        limit: usize,
    },
    /// Socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub use frame::{encode_frame, FrameDecoder, FRAME_HEADER_LEN};
pub use tcp::{TcpServerBuilder, TcpServerHandle, TcpTransport};
