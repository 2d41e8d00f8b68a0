//! Session tokens binding a direct connection to the offer that announced it.

use std::fmt;

use rand::Rng;
use roomdrop_data_channel::wire::TOKEN_LEN;

/// Random bytes per token (hex-encoded to [`TOKEN_LEN`] characters).
const TOKEN_BYTES: usize = TOKEN_LEN / 2;

/// A CSPRNG token rendered as 32 lowercase hex characters.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parses a token received in a session description.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == TOKEN_LEN && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares against a received token in constant time.
    pub fn matches(&self, received: &str) -> bool {
        if received.len() != self.0.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in received.bytes().zip(self.0.bytes()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

// Tokens stay out of logs.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}
