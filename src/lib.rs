pub mod config;
pub mod error;
pub mod logging;
pub mod nostr;
pub mod session;
pub mod transcript;

pub use config::Config;
pub use error::{ChannelError, ConnectError, DesyncError, SendError};
pub use session::{ConnectionState, SessionChannel, SessionHandle, SessionNotice};
pub use transcript::{DeliveryState, Message, MessageId, MessageKind, Nonce, TranscriptBuilder};
