//! Wire vocabulary shared by the gateway and its drivers: topics, consumer
//! identities, presence directories and chat record bodies. No I/O.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use identity::ConsumerIdentity;
pub use protocol::{ChatMessage, FileFragment, InboundMessage, MessageBody, PresenceNotice};
pub use types::{GroupState, PresenceDirectory, Topic};
