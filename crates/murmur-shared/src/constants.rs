/// Prefix every chat participant's consumer group id starts with
pub const GROUP_PREFIX: &str = "chat-user-";

/// Length of the random suffix appended to a consumer group id
pub const GROUP_SUFFIX_LEN: usize = 8;

/// Alphabet the group suffix is drawn from
pub const GROUP_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Display name of the always-present broadcast room
pub const BROADCAST_ROOM: &str = "global";

/// Topic wire names
pub const TOPIC_BROADCAST: &str = "global-chat";
pub const TOPIC_DIRECT: &str = "private-messages";
pub const TOPIC_USER_JOINED: &str = "user-joined";
pub const TOPIC_USER_LEFT: &str = "user-left";

/// Raw file bytes per fragment (750 KiB). A multiple of 3 keeps every
/// fragment's base64 text independently decodable.
pub const DEFAULT_CHUNK_SIZE: usize = 750 * 1024;

/// Largest record body the producer will send. A full fragment encodes to
/// roughly 1 000 240 bytes once base64 and the JSON envelope are added, so
/// this sits above that and below the broker's default topic limit of
/// 1 048 588 bytes.
pub const MAX_RECORD_BYTES: usize = 1_048_576;

/// Broker connection establishment timeout in milliseconds
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 3_000;

/// Broker request timeout in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Idle lifetime of a partially received transfer in seconds
pub const DEFAULT_TRANSFER_TTL_SECS: u64 = 300;

/// Interval between background presence refreshes in seconds
pub const DEFAULT_PRESENCE_REFRESH_SECS: u64 = 30;

/// Interval between router housekeeping ticks in seconds
pub const DEFAULT_ROUTER_SWEEP_SECS: u64 = 30;

/// Default Kafka bootstrap servers
pub const DEFAULT_BROKERS: &str = "localhost:9092";

/// Default Kafka client id
pub const DEFAULT_CLIENT_ID: &str = "murmur-chat";

/// Depth of the record channel between a consumer and the router
pub const RECORD_QUEUE_DEPTH: usize = 256;
