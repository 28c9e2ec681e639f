//! Channel arguments and the resolved channel configuration.

/// Well-known argument keys.
pub mod arg_keys {
    /// Maximum accepted incoming message length, in bytes (int).
    pub const MAX_MESSAGE_LENGTH: &str = "trellis.max_message_length";
    /// Receive read-ahead bound per transport op, in bytes (int).
    pub const READ_AHEAD_BYTES: &str = "trellis.read_ahead_bytes";
    /// Default `:authority` for calls that do not supply one (string).
    pub const DEFAULT_AUTHORITY: &str = "trellis.default_authority";
}

const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;
const DEFAULT_READ_AHEAD_BYTES: usize = 64 * 1024;

fn read_ahead_override() -> Option<usize> {
    std::env::var("TRELLIS_READ_AHEAD")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
}

/// Argument value for one channel arg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Int(i64),
    Str(String),
}

/// An ordered key/value bag handed to every filter at channel construction.
#[derive(Debug, Clone, Default)]
pub struct ChannelArgs {
    entries: Vec<(String, ArgValue)>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_int(mut self, key: &str, value: i64) -> Self {
        self.entries.push((key.to_string(), ArgValue::Int(value)));
        self
    }

    pub fn set_str(mut self, key: &str, value: &str) -> Self {
        self.entries
            .push((key.to_string(), ArgValue::Str(value.to_string())));
        self
    }

    /// Last setting of a key wins, matching how arg lists are layered.
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(ArgValue::Int(v)) => Some(*v),
            Some(ArgValue::Str(_)) => {
                tracing::warn!(key, "channel arg has wrong type, expected int; ignoring");
                None
            }
            None => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(ArgValue::Str(v)) => Some(v),
            Some(ArgValue::Int(_)) => {
                tracing::warn!(key, "channel arg has wrong type, expected string; ignoring");
                None
            }
            None => None,
        }
    }
}

/// Configuration resolved from channel args once, at channel construction.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Incoming messages longer than this cancel the call.
    pub max_message_length: usize,
    /// Upper bound on `max_recv_bytes` per transport receive request, so a
    /// slow reader cannot force unbounded buffering.
    pub read_ahead_bytes: usize,
    /// `:authority` injected into calls created without one.
    pub default_authority: Option<String>,
}

impl ChannelConfig {
    pub fn from_args(args: &ChannelArgs) -> Self {
        let max_message_length = args
            .get_int(arg_keys::MAX_MESSAGE_LENGTH)
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGE_LENGTH);
        let read_ahead_bytes = read_ahead_override()
            .or_else(|| {
                args.get_int(arg_keys::READ_AHEAD_BYTES)
                    .and_then(|v| usize::try_from(v).ok())
                    .filter(|v| *v > 0)
            })
            .unwrap_or(DEFAULT_READ_AHEAD_BYTES);
        let default_authority = args.get_str(arg_keys::DEFAULT_AUTHORITY).map(str::to_string);
        Self {
            max_message_length,
            read_ahead_bytes,
            default_authority,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_args(&ChannelArgs::new())
    }
}
