use rand::Rng;
use serde::Serialize;

use crate::constants::{GROUP_PREFIX, GROUP_SUFFIX_ALPHABET, GROUP_SUFFIX_LEN};

/// A participant's identity on the broker.
/// The display name is free text; the group id is what the broker sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerIdentity {
    display_name: String,
    group_id: String,
}

impl ConsumerIdentity {
    /// Generate a fresh identity with a random group suffix
    pub fn generate(display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            group_id: encode(display_name),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// The name other participants recover from this identity's group id.
    pub fn announced_name(&self) -> Option<String> {
        decode(&self.group_id)
    }
}

/// Strip every character outside `[A-Za-z0-9]`.
pub fn sanitize(display_name: &str) -> String {
    display_name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Build a consumer group id: `chat-user-<sanitized name>-<random suffix>`.
/// Never fails; a name with no alphanumerics yields an empty name segment.
pub fn encode(display_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..GROUP_SUFFIX_LEN)
        .map(|_| GROUP_SUFFIX_ALPHABET[rng.gen_range(0..GROUP_SUFFIX_ALPHABET.len())] as char)
        .collect();
    encode_with_suffix(display_name, &suffix)
}

pub fn encode_with_suffix(display_name: &str, suffix: &str) -> String {
    format!("{GROUP_PREFIX}{}-{suffix}", sanitize(display_name))
}

/// Recover the display name from a group id built by [`encode`].
///
/// Returns `None` unless the id is `chat-user-<name>-<suffix>` with a
/// non-empty name and a non-empty `[a-z0-9]` suffix.
pub fn decode(group_id: &str) -> Option<String> {
    let rest = group_id.strip_prefix(GROUP_PREFIX)?;
    let (name, suffix) = rest.rsplit_once('-')?;

    if name.is_empty() || suffix.is_empty() {
        return None;
    }
    if !suffix
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        return None;
    }

    Some(name.to_string())
}
