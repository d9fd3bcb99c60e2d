//! Discovery session: find the target device among nearby broadcasters.
//!
//! A scan runs for a fixed window. Every observation from the radio is
//! canonicalized and matched against the target; the first match locks the
//! session, later matches from the same identity replace the stored payload
//! so the freshest advertisement wins.

use crate::identity::{DeviceIdentity, canonicalize, matches};
use crate::key::DeviceBinding;
use crate::scanner::{Observation, Radio, ScanError};
use crate::victron::Header;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default length of the discovery window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

/// An advertisement payload attributed to its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub sender: DeviceIdentity,
    pub payload: Vec<u8>,
}

/// Errors returned by a discovery scan.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("device {target} not found within {window:?}")]
    NotFound {
        target: DeviceIdentity,
        window: Duration,
    },
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("scan cancelled")]
    Cancelled,
}

/// Where a session stands with respect to the target device.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Scanning,
    /// Locked onto the target; holds its most recent advertisement.
    Locked(RawAdvertisement),
    Failed,
}

/// Session state plus the transitions a scan drives.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Session {
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, SessionState::Locked(_))
    }

    /// The latest payload of the locked device.
    pub fn latest(&self) -> Option<&RawAdvertisement> {
        match &self.state {
            SessionState::Locked(raw) => Some(raw),
            _ => None,
        }
    }

    /// Feed one observation. Returns true when it matched the target.
    pub fn observe(&mut self, observation: Observation, binding: &DeviceBinding) -> bool {
        let sender = canonicalize(&observation.sender);
        if !matches(&sender, &binding.identity) {
            trace!(sender = %sender, "ignoring advertisement from other device");
            return false;
        }

        if let Ok(header) = Header::parse(&observation.payload)
            && !header.accepts(&binding.key)
        {
            warn!(
                identity = %sender,
                key = %binding.key,
                "advertisement key check byte does not match configured key"
            );
        }

        if !self.is_locked() {
            info!(identity = %sender, "locked onto device");
        } else {
            debug!(identity = %sender, bytes = observation.payload.len(), "newer advertisement");
        }

        self.state = SessionState::Locked(RawAdvertisement {
            sender,
            payload: observation.payload,
        });
        true
    }

    /// Scan for `window`, updating the session with every matching observation.
    ///
    /// An unlocked session moves to `Scanning` and ends `Locked` or `Failed`.
    /// A locked session stays locked, keeping its previous payload when the
    /// device is not heard from again.
    pub async fn scan(
        &mut self,
        radio: &dyn Radio,
        binding: &DeviceBinding,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<&RawAdvertisement, DiscoveryError> {
        let was_locked = self.is_locked();
        if !was_locked {
            self.state = SessionState::Scanning;
        }

        let mut observations = match radio.start_scan().await {
            Ok(rx) => rx,
            Err(e) => {
                if !was_locked {
                    self.state = SessionState::Failed;
                }
                return Err(e.into());
            }
        };

        debug!(device = %binding.identity, ?window, "scanning");
        let deadline = sleep_until(Instant::now() + window);
        tokio::pin!(deadline);

        let mut matched = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if !was_locked {
                        self.state = SessionState::Idle;
                    }
                    return Err(DiscoveryError::Cancelled);
                }
                _ = &mut deadline => break,
                observation = observations.recv() => match observation {
                    Some(observation) => {
                        if self.observe(observation, binding) {
                            matched += 1;
                        }
                    }
                    None => {
                        debug!("radio stopped before the window elapsed");
                        break;
                    }
                },
            }
        }
        // Dropping the receiver stops the radio.
        drop(observations);

        debug!(matched, "scan window closed");
        if !self.is_locked() {
            self.state = SessionState::Failed;
        }
        self.latest().ok_or_else(|| DiscoveryError::NotFound {
            target: binding.identity.clone(),
            window,
        })
    }
}

impl From<RawAdvertisement> for Session {
    fn from(raw: RawAdvertisement) -> Self {
        Self {
            state: SessionState::Locked(raw),
        }
    }
}

/// Run a fresh discovery session and return the target's latest payload.
///
/// # Errors
/// `DiscoveryError::NotFound` when the target is not heard from within
/// `window`; `Scan` when the radio fails to start; `Cancelled` on shutdown.
pub async fn discover(
    radio: &dyn Radio,
    binding: &DeviceBinding,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<RawAdvertisement, DiscoveryError> {
    let mut session = Session::new();
    session.scan(radio, binding, window, cancel).await.cloned()
}
