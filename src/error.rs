//! Crate error types
//!
//! One error enum covers the whole routing core. Transport implementations
//! report terminal failure as [`Error::TransportClosed`]; every other
//! transport error is treated as transient by the router loops.

use thiserror::Error;

/// Error type for router, plugin chain, and transport operations
#[derive(Debug, Error)]
pub enum Error {
    /// Plugin configuration options are missing or contradict each other
    #[error("invalid plugin configuration: {0}")]
    InvalidConfig(String),

    /// The transport has terminated; no further reads or writes are possible
    #[error("transport closed")]
    TransportClosed,

    /// An RTP write failed; counted against the transport's write-error budget
    #[error("rtp write failed: {0}")]
    WriteRtp(String),

    /// An RTCP write failed
    #[error("rtcp write failed: {0}")]
    WriteRtcp(String),

    /// The router already has a publisher attached
    #[error("router already has a publisher")]
    PublisherExists,

    /// Wire encoding of an RTP packet failed
    #[error("marshal failed: {0}")]
    Marshal(#[from] webrtc_util::Error),

    /// Socket error from a forwarding endpoint
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("rtpforwarder enabled without addr".into());
        assert_eq!(
            err.to_string(),
            "invalid plugin configuration: rtpforwarder enabled without addr"
        );

        assert_eq!(Error::TransportClosed.to_string(), "transport closed");
        assert_eq!(
            Error::PublisherExists.to_string(),
            "router already has a publisher"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
