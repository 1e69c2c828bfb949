mod local_channel;
pub use local_channel::{LocalChannel, LocalChannelConfig};
