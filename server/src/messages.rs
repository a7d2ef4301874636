use bytes::Bytes;
use joblib::socket::MessageHandler;
use tracing::info;

/// Writes every out-of-band message to the log, tagged with the channel it came in on.
pub struct LogHandler {
    channel: &'static str,
}

impl LogHandler {
    pub fn new(channel: &'static str) -> Self {
        Self { channel }
    }
}

impl MessageHandler for LogHandler {
    fn handle(&self, message: Bytes) {
        info!(
            channel = self.channel,
            bytes = message.len(),
            message = %String::from_utf8_lossy(&message),
            "control message received"
        );
    }
}
