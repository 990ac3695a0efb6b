//! Tunnel status and session-id negotiation.
//!
//! Every packet carries `(sender session, recipient session)`. The receiver
//! compares the sender's session with the last one it knows for the peer,
//! and the claimed recipient session with its own:
//!
//! ```text
//!                  recipient == ours   recipient unknown   recipient other
//! sender stale     ignore              ignore              ignore
//! sender current   process             notify              ignore
//! sender newer     adopt + process     adopt + notify      ignore
//! ```
//!
//! An unknown sender session counts as stale. Five cells ignore the packet
//! outright, including the newer-sender/other-recipient cell, which does not
//! adopt either. That asymmetry is kept as-is.

use crate::ids::SessionId;
use std::fmt;

/// Tunnel connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelStatus {
    /// No connected link; reconnection is attempted automatically
    #[default]
    Disconnected,
    /// At least one connected link
    Connected,
    /// Torn down; only `awaken` leaves this state
    Closed,
}

impl TunnelStatus {
    /// Check if the tunnel can carry data
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// Check if a transition to `next` is legal
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TunnelStatus::{Closed, Connected, Disconnected};
        matches!(
            (self, next),
            (Disconnected, Connected) | (Connected, Disconnected) | (_, Closed) | (Closed, Disconnected)
        )
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Closed => "closed",
        })
    }
}

/// What to do with the payload of a classified packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Drop the packet entirely
    Ignore,
    /// Link bookkeeping and a session-correcting reply, no payload
    NotifyOnly,
    /// Handle the payload
    Process,
}

/// Outcome of [`classify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionVerdict {
    /// The sender announced a newer session that must be adopted first
    pub adopt: bool,
    /// Payload handling
    pub action: SessionAction,
}

impl SessionVerdict {
    const IGNORE: Self = Self {
        adopt: false,
        action: SessionAction::Ignore,
    };
}

/// Classify an inbound `(sender, recipient)` session pair.
///
/// `remote` is the last known session of the peer and `local` our own.
#[must_use]
pub fn classify(
    remote: SessionId,
    local: SessionId,
    sender: SessionId,
    recipient: SessionId,
) -> SessionVerdict {
    if !sender.is_known() || (remote.is_known() && sender < remote) {
        return SessionVerdict::IGNORE;
    }
    let adopt = sender != remote;
    let action = if recipient == local {
        SessionAction::Process
    } else if !recipient.is_known() {
        SessionAction::NotifyOnly
    } else {
        return SessionVerdict::IGNORE;
    };
    SessionVerdict { adopt, action }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OURS: SessionId = SessionId::from_u64(100);
    const KNOWN: SessionId = SessionId::from_u64(50);

    fn sid(v: u64) -> SessionId {
        SessionId::from_u64(v)
    }

    fn verdict(adopt: bool, action: SessionAction) -> SessionVerdict {
        SessionVerdict { adopt, action }
    }

    #[test]
    fn test_stale_sender_always_ignored() {
        for recipient in [OURS, SessionId::UNKNOWN, sid(7)] {
            assert_eq!(classify(KNOWN, OURS, sid(40), recipient), SessionVerdict::IGNORE);
        }
    }

    #[test]
    fn test_current_sender() {
        assert_eq!(
            classify(KNOWN, OURS, KNOWN, OURS),
            verdict(false, SessionAction::Process)
        );
        assert_eq!(
            classify(KNOWN, OURS, KNOWN, SessionId::UNKNOWN),
            verdict(false, SessionAction::NotifyOnly)
        );
        assert_eq!(classify(KNOWN, OURS, KNOWN, sid(99)), SessionVerdict::IGNORE);
    }

    #[test]
    fn test_newer_sender() {
        assert_eq!(
            classify(KNOWN, OURS, sid(60), OURS),
            verdict(true, SessionAction::Process)
        );
        assert_eq!(
            classify(KNOWN, OURS, sid(60), SessionId::UNKNOWN),
            verdict(true, SessionAction::NotifyOnly)
        );
        assert_eq!(classify(KNOWN, OURS, sid(60), sid(99)), SessionVerdict::IGNORE);
    }

    #[test]
    fn test_five_of_nine_cells_ignore() {
        let senders = [sid(40), KNOWN, sid(60)];
        let recipients = [OURS, SessionId::UNKNOWN, sid(99)];
        let ignored = senders
            .iter()
            .flat_map(|s| recipients.iter().map(move |r| classify(KNOWN, OURS, *s, *r)))
            .filter(|v| v.action == SessionAction::Ignore)
            .count();
        assert_eq!(ignored, 5);
    }

    #[test]
    fn test_first_contact_adopts() {
        let v = classify(SessionId::UNKNOWN, OURS, sid(5), SessionId::UNKNOWN);
        assert_eq!(v, verdict(true, SessionAction::NotifyOnly));
        assert_eq!(
            classify(SessionId::UNKNOWN, OURS, SessionId::UNKNOWN, OURS),
            SessionVerdict::IGNORE
        );
    }

    #[test]
    fn test_status_transitions() {
        use TunnelStatus::*;
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Disconnected));
        assert!(!Closed.can_transition_to(Connected));
    }
}
