use crate::mailbox::FrameMailbox;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disabled = 0,
    Connecting = 1,
    Streaming = 2,
    Failed = 3,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Failed,
            _ => Self::Disabled,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Failed => "failed",
        }
    }
}

/// Everything one slot's worker shares with the renderer.
///
/// The worker is the only writer of `state`, the mailbox and `last_error`;
/// the UI thread only reads them.
#[derive(Debug)]
pub struct TileState {
    state: AtomicU8,
    mailbox: FrameMailbox,
    last_error: Mutex<Option<String>>,
}

impl TileState {
    pub fn new() -> Self {
        Self::with_state(ConnectionState::Connecting)
    }

    pub fn disabled() -> Self {
        Self::with_state(ConnectionState::Disabled)
    }

    fn with_state(state: ConnectionState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            mailbox: FrameMailbox::new(),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Disabled is terminal: a disabled tile ignores every transition.
    pub fn set_state(&self, next: ConnectionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == ConnectionState::Disabled as u8 || next == ConnectionState::Disabled {
                    None
                } else {
                    Some(next as u8)
                }
            });
    }

    pub fn mailbox(&self) -> &FrameMailbox {
        &self.mailbox
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Default for TileState {
    fn default() -> Self {
        Self::new()
    }
}
