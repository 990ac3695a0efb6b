//! Application-facing events.
//!
//! Every notification the engine produces is one [`Event`] variant pushed into
//! an unbounded channel. Emitting never blocks and never calls back into the
//! application, so it is safe while tunnel locks are held.

use crate::ids::{FileHash, Route, TaskId, TunnelHandle};
use crossbeam_channel::{Receiver, Sender};
use std::fmt;

/// Why an incoming file transfer stopped before completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileInterruptReason {
    /// The tunnel was closed
    TunnelClosed,
    /// The writer reported a write or finalize failure
    DiskError,
    /// The writer could not store or return the control block
    ControlCorrupt,
    /// The peer does not share the requested file
    NotFound,
    /// The peer failed to read the file
    PeerReadFailed,
}

impl FileInterruptReason {
    /// Wire code carried by a file rejection
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::TunnelClosed => 0,
            Self::DiskError => 1,
            Self::ControlCorrupt => 2,
            Self::NotFound => 3,
            Self::PeerReadFailed => 4,
        }
    }

    /// Parse a wire code, defaulting unknown codes to [`Self::NotFound`]
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::TunnelClosed,
            1 => Self::DiskError,
            2 => Self::ControlCorrupt,
            4 => Self::PeerReadFailed,
            _ => Self::NotFound,
        }
    }
}

impl fmt::Display for FileInterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TunnelClosed => "tunnel closed",
            Self::DiskError => "disk error",
            Self::ControlCorrupt => "control data corrupt",
            Self::NotFound => "file not found on peer",
            Self::PeerReadFailed => "peer failed to read file",
        };
        f.write_str(s)
    }
}

/// Engine notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A tunnel entered the registry
    Attached {
        /// Tunnel handle
        tunnel: TunnelHandle,
    },
    /// A tunnel left the registry
    Detached {
        /// Tunnel handle
        tunnel: TunnelHandle,
    },
    /// The tunnel gained its first connected link
    Connected {
        /// Tunnel handle
        tunnel: TunnelHandle,
    },
    /// The tunnel lost its last connected link
    Disconnected {
        /// Tunnel handle
        tunnel: TunnelHandle,
    },
    /// One link became connected
    LinkConnected {
        /// Tunnel handle
        tunnel: TunnelHandle,
        /// Path of the link
        route: Route,
    },
    /// One link lost connectivity
    LinkDisconnected {
        /// Tunnel handle
        tunnel: TunnelHandle,
        /// Path of the link
        route: Route,
    },
    /// Outcome of an outgoing message
    MessageSent {
        /// Tunnel handle
        tunnel: TunnelHandle,
        /// Caller-supplied completion token
        cookie: u64,
        /// Whether the peer confirmed the message
        success: bool,
    },
    /// A complete message arrived
    MessageReceived {
        /// Tunnel handle
        tunnel: TunnelHandle,
        /// Message bytes
        data: Vec<u8>,
    },
    /// A download finished and was finalized
    FileDownloaded {
        /// Tunnel handle
        tunnel: TunnelHandle,
        /// Download id
        download: TaskId,
        /// File hash
        hash: FileHash,
    },
    /// A download stopped early
    FileInterrupted {
        /// Tunnel handle
        tunnel: TunnelHandle,
        /// Download id
        download: TaskId,
        /// File hash
        hash: FileHash,
        /// Why it stopped
        reason: FileInterruptReason,
    },
    /// The peer started pulling a shared file
    FileRequested {
        /// Tunnel handle
        tunnel: TunnelHandle,
        /// File hash
        hash: FileHash,
    },
    /// An upload ended (completed, cancelled, or torn down)
    FileUnrequested {
        /// Tunnel handle
        tunnel: TunnelHandle,
        /// File hash
        hash: FileHash,
    },
}

impl Event {
    /// Tunnel the event belongs to
    #[must_use]
    pub fn tunnel(&self) -> TunnelHandle {
        match self {
            Self::Attached { tunnel }
            | Self::Detached { tunnel }
            | Self::Connected { tunnel }
            | Self::Disconnected { tunnel }
            | Self::LinkConnected { tunnel, .. }
            | Self::LinkDisconnected { tunnel, .. }
            | Self::MessageSent { tunnel, .. }
            | Self::MessageReceived { tunnel, .. }
            | Self::FileDownloaded { tunnel, .. }
            | Self::FileInterrupted { tunnel, .. }
            | Self::FileRequested { tunnel, .. }
            | Self::FileUnrequested { tunnel, .. } => *tunnel,
        }
    }
}

/// Sending half of the event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    /// Create a sink and its receiver
    #[must_use]
    pub fn channel() -> (Self, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Push an event; dropped silently if the receiver is gone
    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_roundtrip() {
        for reason in [
            FileInterruptReason::TunnelClosed,
            FileInterruptReason::DiskError,
            FileInterruptReason::ControlCorrupt,
            FileInterruptReason::NotFound,
            FileInterruptReason::PeerReadFailed,
        ] {
            assert_eq!(FileInterruptReason::from_code(reason.code()), reason);
        }
        assert_eq!(
            FileInterruptReason::from_code(200),
            FileInterruptReason::NotFound
        );
    }

    #[test]
    fn test_sink_delivers_in_order() {
        let (sink, rx) = EventSink::channel();
        let t = TunnelHandle::new(1, 1);
        sink.emit(Event::Attached { tunnel: t });
        sink.emit(Event::Connected { tunnel: t });
        assert_eq!(rx.try_recv().unwrap(), Event::Attached { tunnel: t });
        assert_eq!(rx.try_recv().unwrap().tunnel(), t);
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(Event::Detached {
            tunnel: TunnelHandle::INVALID,
        });
    }
}
