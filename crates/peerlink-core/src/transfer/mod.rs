//! Transfer sessions: the data plane of one logical transfer.
//!
//! ```text
//! Idle ──▶ AwaitingDirectConnection ──▶ Transferring ──▶ Finished
//!   │                │                      │
//!   └────────────────┴──────▶ Aborted ◀─────┘
//! ```

mod progress;
mod session;
mod sink;

pub use progress::TransferProgress;
pub use session::TransferSession;
pub use sink::DataSink;

use crate::envelope::AppId;
use crate::header::v1::V1Flags;
use crate::header::v2::TfCombination;
use std::fmt;

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, invitation not yet answered
    Idle,
    /// Waiting for a direct socket before moving data
    AwaitingDirectConnection,
    /// Data is moving
    Transferring,
    /// All data moved
    Finished,
    /// Stopped before completion
    Aborted,
}

impl TransferState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::AwaitingDirectConnection => write!(f, "AwaitingDirectConnection"),
            Self::Transferring => write!(f, "Transferring"),
            Self::Finished => write!(f, "Finished"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Which way data flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local side reads the sink and sends
    Send,
    /// Local side receives and writes the sink
    Receive,
}

/// What is being transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Display picture object
    DisplayPicture,
    /// Custom emoticon object
    CustomEmoticon,
    /// File
    File,
    /// Activity data
    Activity,
}

impl TransferKind {
    /// Footer application id of data envelopes
    #[must_use]
    pub fn app_id(self) -> AppId {
        match self {
            Self::DisplayPicture => AppId::DISPLAY_PICTURE,
            Self::CustomEmoticon => AppId::CUSTOM_EMOTICON,
            Self::File => AppId::FILE_TRANSFER,
            Self::Activity => AppId::NONE,
        }
    }

    /// Whether the payload is an MSN object (display picture or emoticon)
    #[must_use]
    pub fn is_msn_object(self) -> bool {
        matches!(self, Self::DisplayPicture | Self::CustomEmoticon)
    }

    /// V1 flags of data envelopes
    #[must_use]
    pub fn v1_flags(self) -> V1Flags {
        match self {
            Self::DisplayPicture | Self::CustomEmoticon => V1Flags::MSN_OBJECT_DATA,
            Self::File => V1Flags::FILE_DATA,
            Self::Activity => V1Flags::DATA,
        }
    }

    /// V2 fragmentation flags of data envelopes (without `FIRST`)
    #[must_use]
    pub fn tf_combination(self) -> TfCombination {
        match self {
            Self::DisplayPicture | Self::CustomEmoticon => TfCombination::MSN_OBJECT,
            Self::File => TfCombination::FILE_TRANSFER,
            Self::Activity => TfCombination::NONE,
        }
    }
}

/// Signals raised by a transfer session
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// State changed
    StateChanged(TransferState),
    /// More data moved
    Progress(TransferProgress),
    /// All data moved
    Finished,
    /// Transfer stopped before completion
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_markers() {
        assert_eq!(TransferKind::File.app_id(), AppId(2));
        assert_eq!(TransferKind::DisplayPicture.app_id(), AppId(12));
        assert_eq!(TransferKind::CustomEmoticon.app_id(), AppId(11));
        assert_eq!(TransferKind::CustomEmoticon.v1_flags().bits(), 0x0100_0020);
        assert!(TransferKind::DisplayPicture.is_msn_object());
        assert!(!TransferKind::File.is_msn_object());
        assert_eq!(TransferKind::File.tf_combination().bits(), 0x06);
        assert!(TransferState::Aborted.is_terminal());
        assert!(!TransferState::AwaitingDirectConnection.is_terminal());
    }
}
