use crate::channel::ChannelId;
use crate::error::ChannelResult;
use crate::listener::ListenerFlags;

/// Outbound boundary between the channel manager and the transport layer.
///
/// Implementations own framing, encryption and delivery; none of that is
/// the manager's concern. No call may block indefinitely: either the data
/// is accepted for transmission or an error is returned immediately.
/// Acceptance does not imply the peer has received anything.
pub trait Transport: Send + Sync {
    /// Advertises a freshly registered listener to the remote peer.
    fn announce_listener(&self, name: &str, flags: ListenerFlags) -> ChannelResult<()>;

    /// Hands one chunk of channel payload to the transport for transmission.
    fn send_channel_data(&self, channel_id: ChannelId, data: &[u8]) -> ChannelResult<()>;

    /// Signals channel teardown to the remote peer.
    fn send_channel_close(&self, channel_id: ChannelId) -> ChannelResult<()>;

    /// Largest payload `send_channel_data` accepts in one call.
    ///
    /// When `Some`, the manager fragments each logical write into chunks of
    /// at most this many bytes; plugins never deal with fragmentation.
    fn max_chunk_len(&self) -> Option<usize> {
        None
    }
}

assert_obj_safe!(Transport);
