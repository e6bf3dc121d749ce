use ivalink_codec::{CodecError, RegistryError};
use ivalink_core::prelude::ChannelId;

/// Errors surfaced by link commands.
///
/// Problems local to a single frame are absorbed by the link and never show
/// up here; only create-time and command-level failures do.
///
/// # Example
/// ```rust
/// use ivalink::LinkError;
///
/// let err = LinkError::InvalidChannel(9);
/// assert_eq!(err.code(), "invalid_channel");
/// assert!(!err.retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("channel {0} is out of range")]
    InvalidChannel(ChannelId),
    #[error("channel {0} is already created")]
    AlreadyCreated(ChannelId),
    #[error("channel {0} is not created")]
    NotCreated(ChannelId),
    /// Codec or output memory could not be allocated; the channel was rolled back.
    #[error("channel {0}: resource allocation failed")]
    ResourceAllocationFailed(ChannelId),
    #[error("{0} exhausted")]
    ResourceExhausted(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The link was stopped; only statistics and delete are still served.
    #[error("link is stopped")]
    Stopped,
    /// The link task is gone.
    #[error("link task disconnected")]
    Disconnected,
}

impl LinkError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::InvalidChannel(_) => "invalid_channel",
            LinkError::AlreadyCreated(_) => "already_created",
            LinkError::NotCreated(_) => "not_created",
            LinkError::ResourceAllocationFailed(_) => "resource_allocation_failed",
            LinkError::ResourceExhausted(_) => "resource_exhausted",
            LinkError::InvalidArg(_) => "invalid_arg",
            LinkError::Codec(_) => "codec_error",
            LinkError::Registry(_) => "registry_error",
            LinkError::Stopped => "stopped",
            LinkError::Disconnected => "disconnected",
        }
    }

    /// Whether the same command may succeed later.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LinkError::ResourceAllocationFailed(_) | LinkError::ResourceExhausted(_)
        )
    }
}
