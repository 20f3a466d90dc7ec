/// Participation of a registered thread in the concurrency gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum LockState {
    /// Not participating; writers do not wait for this thread.
    #[default]
    Unlocked,
    /// Long-lived shared participant; writers wait until it checks in.
    Passive,
    /// Passive participation suspended around a blocking call.
    TemporarilyUnlocked,
}

impl LockState {
    /// Encodes the state for atomic storage.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Unlocked => 0,
            Self::Passive => 1,
            Self::TemporarilyUnlocked => 2,
        }
    }

    /// Decodes a stored state. Unknown encodings read as [`Self::Unlocked`].
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Passive,
            2 => Self::TemporarilyUnlocked,
            _ => Self::Unlocked,
        }
    }

    /// Returns `true` when a writer must wait for this thread.
    #[must_use]
    pub const fn blocks_writer(self) -> bool {
        matches!(self, Self::Passive)
    }
}
