//! Minimal invitation exchange used by `peerlink send` / `peerlink receive`.
//!
//! ```text
//! sender                                   receiver
//!   │ ── INVITE (SessionID, Filename, Size) ─▶ │  creates the transfer
//!   │ ◀─────────────────────────── 200 OK ──── │
//!   │ ══ data envelopes ═════════════════════▶ │
//!   │ ◀─────────────────────────────── BYE ─── │  after the last octet
//! ```

use crossbeam_channel::{Receiver, Sender};
use peerlink_core::{
    Envelope, MessageSession, SignalingHandler, SignalingMessage, TransferConfig,
    TransferDirection, TransferEvent, TransferKind, TransferSession,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Protocol tag of every signaling message
pub const SLP_VERSION: &str = "MSNSLP/1.0";

/// File offer carried by an INVITE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Correlates the replies
    pub call_id: String,
    /// Transfer session id chosen by the sender
    pub session_id: u32,
    /// Name of the offered file
    pub filename: String,
    /// Size of the offered file
    pub size: u64,
}

impl Invitation {
    /// Encode as an INVITE addressed to `to`
    #[must_use]
    pub fn to_message(&self, to: &str) -> SignalingMessage {
        SignalingMessage::request("INVITE", &format!("MSNMSGR:{to}"), SLP_VERSION)
            .with_header("To", format!("<msnmsgr:{to}>"))
            .with_header("Call-ID", self.call_id.clone())
            .with_header("SessionID", self.session_id.to_string())
            .with_header("Filename", self.filename.clone())
            .with_header("Size", self.size.to_string())
    }

    /// Decode an INVITE; `None` for any other message
    #[must_use]
    pub fn parse(message: &SignalingMessage) -> Option<Self> {
        if message.method() != Some("INVITE") {
            return None;
        }
        Some(Self {
            call_id: message.header("Call-ID")?.to_string(),
            session_id: message.header("SessionID")?.parse().ok()?,
            filename: message.header("Filename")?.to_string(),
            size: message.header("Size")?.parse().ok()?,
        })
    }

    /// Offered name reduced to its last path component
    #[must_use]
    pub fn safe_filename(&self) -> Option<&str> {
        Path::new(&self.filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "..")
    }
}

/// Status reply to an invitation
#[must_use]
pub fn reply(call_id: &str, session_id: u32, code: u16, reason: &str) -> SignalingMessage {
    SignalingMessage::status(SLP_VERSION, code, reason)
        .with_header("Call-ID", call_id)
        .with_header("SessionID", session_id.to_string())
}

/// End of the exchange
#[must_use]
pub fn bye(to: &str, call_id: &str) -> SignalingMessage {
    SignalingMessage::request("BYE", &format!("MSNMSGR:{to}"), SLP_VERSION)
        .with_header("Call-ID", call_id)
}

/// A transfer accepted by [`AcceptFiles`]
pub struct Accepted {
    /// The offer
    pub invitation: Invitation,
    /// The receiving transfer
    pub transfer: Arc<TransferSession>,
    /// Events subscribed before any data could arrive
    pub events: Receiver<TransferEvent>,
    /// Where the file is written
    pub path: PathBuf,
}

/// Receiver side: accepts every file offer into `output`
pub struct AcceptFiles {
    output: PathBuf,
    config: TransferConfig,
    accepted: Sender<Accepted>,
}

impl AcceptFiles {
    /// Handler writing files into `output`
    #[must_use]
    pub fn new(output: PathBuf, config: TransferConfig, accepted: Sender<Accepted>) -> Self {
        Self {
            output,
            config,
            accepted,
        }
    }

    fn accept(
        &self,
        session: &Arc<MessageSession>,
        invitation: &Invitation,
    ) -> anyhow::Result<Accepted> {
        let Some(name) = invitation.safe_filename() else {
            anyhow::bail!("refusing file name {:?}", invitation.filename);
        };
        let path = self.output.join(name);
        let file = File::options().read(true).write(true).create(true).truncate(true).open(&path)?;

        let transfer = TransferSession::with_id(
            session,
            invitation.session_id,
            TransferDirection::Receive,
            TransferKind::File,
            Box::new(file),
            self.config.clone(),
        )?;
        let events = transfer.subscribe();
        let ok = reply(&invitation.call_id, invitation.session_id, 200, "OK");
        transfer.accept_invitation(Envelope::signaling(session.version(), &ok))?;

        Ok(Accepted {
            invitation: invitation.clone(),
            transfer,
            events,
            path,
        })
    }
}

impl SignalingHandler for AcceptFiles {
    fn handle(&self, session: &Arc<MessageSession>, envelope: &Envelope) {
        let Some(invitation) = envelope.inner_message().and_then(Invitation::parse) else {
            return;
        };
        info!(file = %invitation.filename, size = invitation.size, "file offered");

        match self.accept(session, &invitation) {
            Ok(accepted) => {
                let _ = self.accepted.send(accepted);
            }
            Err(err) => {
                warn!(error = %err, "declining invitation");
                let decline = reply(&invitation.call_id, invitation.session_id, 603, "Decline");
                if let Err(err) = session.send(Envelope::signaling(session.version(), &decline)) {
                    warn!(error = %err, "failed to send decline");
                }
            }
        }
    }
}

/// What the receiver answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// 200 OK, data is moving
    Accepted,
    /// Any other status
    Declined(u16),
    /// Receiver is done
    Bye,
}

/// Sender side: starts the transfer once the offer is accepted
pub struct AwaitAnswer {
    transfer: Arc<TransferSession>,
    answers: Sender<Answer>,
}

impl AwaitAnswer {
    /// Handler driving `transfer`
    #[must_use]
    pub fn new(transfer: Arc<TransferSession>, answers: Sender<Answer>) -> Self {
        Self { transfer, answers }
    }
}

impl SignalingHandler for AwaitAnswer {
    fn handle(&self, _session: &Arc<MessageSession>, envelope: &Envelope) {
        let Some(message) = envelope.inner_message() else {
            return;
        };
        if message.method() == Some("BYE") {
            let _ = self.answers.send(Answer::Bye);
            return;
        }

        let for_us = message
            .header("SessionID")
            .and_then(|v| v.parse::<u32>().ok())
            == Some(self.transfer.id());
        let answer = match message.status_code() {
            Some(_) if !for_us => return,
            Some(200) => {
                if let Err(err) = self.transfer.start() {
                    warn!(error = %err, "failed to start transfer");
                }
                Answer::Accepted
            }
            Some(code) => {
                self.transfer.abort();
                Answer::Declined(code)
            }
            None => return,
        };
        let _ = self.answers.send(answer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::{ProtocolVersion, SessionConfig, TransferState};

    fn offer(filename: &str) -> Invitation {
        Invitation {
            call_id: "{abc}".to_string(),
            session_id: 60_123,
            filename: filename.to_string(),
            size: 4096,
        }
    }

    #[test]
    fn test_invitation_roundtrip() {
        let invitation = offer("report.pdf");
        let message = invitation.to_message("bob");
        let parsed = SignalingMessage::parse(&message.to_bytes()).unwrap();
        assert_eq!(Invitation::parse(&parsed), Some(invitation));
        assert_eq!(Invitation::parse(&bye("bob", "{abc}")), None);
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(offer("../../etc/passwd").safe_filename(), Some("passwd"));
        assert_eq!(offer("dir/photo.jpg").safe_filename(), Some("photo.jpg"));
        assert_eq!(offer("..").safe_filename(), None);
    }

    #[test]
    fn test_accept_files_creates_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handler = AcceptFiles::new(dir.path().to_path_buf(), TransferConfig::default(), tx);
        let session = MessageSession::new("sender", SessionConfig::default());

        let invite = Envelope::signaling(ProtocolVersion::V1, &offer("notes.txt").to_message("me"));
        handler.handle(&session, &invite);

        let accepted = rx.try_recv().unwrap();
        assert_eq!(accepted.transfer.id(), 60_123);
        assert_eq!(accepted.transfer.state(), TransferState::Transferring);
        assert!(accepted.path.ends_with("notes.txt"));
        assert!(session.transfer(60_123).is_some());
        assert_eq!(session.outbox_len(), 1);
    }
}
