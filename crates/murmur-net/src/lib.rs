// Presence-aware chat gateway over a Kafka-style broker.

pub mod chunking;
pub mod config;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod router;
pub mod session;
pub mod transport;

pub use config::GatewayConfig;
pub use error::{BrokerError, GatewayError, Result};
pub use gateway::{Gateway, SendReceipt, Subscription};
pub use router::{RecordHandler, RouterHandle};
pub use session::{BrokerSession, SessionState};
#[cfg(feature = "kafka")]
pub use transport::KafkaTransport;
pub use transport::{BrokerRecord, BrokerTransport, ClientChannel, MemoryBroker, MemoryTransport};
