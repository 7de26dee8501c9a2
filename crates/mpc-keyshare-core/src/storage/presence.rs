//! User-presence confirmation (biometric or device passcode)

use async_trait::async_trait;

/// Result of a presence prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    /// User confirmed
    Granted,
    /// User dismissed the prompt
    Cancelled,
    /// Biometric or passcode check failed
    Failed,
    /// Device has no presence mechanism; reads proceed ungated
    Unavailable,
}

impl PresenceOutcome {
    /// Whether a share read may go ahead after this outcome
    pub fn allows_access(&self) -> bool {
        matches!(self, PresenceOutcome::Granted | PresenceOutcome::Unavailable)
    }
}

/// Prompt gating reads of encrypted key shares
///
/// Implementations must not touch stored records; dismissing the prompt is
/// reported as [`PresenceOutcome::Cancelled`].
#[async_trait]
pub trait PresenceGate: Send + Sync {
    async fn confirm(&self, reason: &str) -> PresenceOutcome;
}

/// Gate for devices without a presence mechanism
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPresenceCheck;

#[async_trait]
impl PresenceGate for NoPresenceCheck {
    async fn confirm(&self, _reason: &str) -> PresenceOutcome {
        PresenceOutcome::Unavailable
    }
}
