//! Protocol constants.

/// Size of one file chunk on the data channel, in bytes.
///
/// The last chunk of a transfer may be shorter.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// A room holds exactly one initiator and one joiner.
pub const MAX_ROOM_PARTICIPANTS: usize = 2;

/// Label given to the data channel created by the initiator.
pub const DATA_CHANNEL_LABEL: &str = "roomdrop-files";
