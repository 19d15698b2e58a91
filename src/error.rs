//! Error classes and the last-error record kept on a peer (spec §4.6, §7).
//!
//! Two distinct error types live here and must not be confused:
//! [`EngineError`] is an ordinary `Result` error, returned from the fallible
//! methods that drive a connection and consumed with `?`. [`LastError`] is
//! the small, `Copy` record the peer retains *after* an `EngineError` has
//! already been handled, because status reporting needs it long after the
//! `Result` that produced it is gone.

use std::fmt;
use std::io;

/// The class of the last error recorded against a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    None,
    Misc,
    Socket,
    BgpRx,
    BgpTx,
    AutoDown,
    ManDown,
}

/// Misc sub-reasons, encoded into `LastError::code` when `class == Misc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MiscReason {
    NeighborLost = 1,
    InvalidNextHop = 2,
    InvalidMd5 = 3,
}

/// Automatic-shutdown sub-reasons, encoded when `class == AutoDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AutoDownReason {
    RouteLimitExceeded = 1,
}

/// Last (non-ignored) error retained on a peer for `get_status` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastError {
    pub class: ErrorClass,
    pub code: u32,
}

impl LastError {
    pub fn none() -> Self {
        Self {
            class: ErrorClass::None,
            code: 0,
        }
    }

    pub fn misc(reason: MiscReason) -> Self {
        Self {
            class: ErrorClass::Misc,
            code: reason as u32,
        }
    }

    pub fn socket(errno: i32) -> Self {
        Self {
            class: ErrorClass::Socket,
            code: errno as u32,
        }
    }

    /// BGP NOTIFICATION we generated (bgp_error, §4.6): code<<16|subcode.
    pub fn bgp_tx(code: u8, subcode: u8) -> Self {
        Self {
            class: ErrorClass::BgpTx,
            code: (u32::from(code) << 16) | u32::from(subcode),
        }
    }

    /// BGP NOTIFICATION the peer sent us.
    pub fn bgp_rx(code: u8, subcode: u8) -> Self {
        Self {
            class: ErrorClass::BgpRx,
            code: (u32::from(code) << 16) | u32::from(subcode),
        }
    }

    pub fn auto_down(reason: AutoDownReason) -> Self {
        Self {
            class: ErrorClass::AutoDown,
            code: reason as u32,
        }
    }

    pub fn man_down() -> Self {
        Self {
            class: ErrorClass::ManDown,
            code: 0,
        }
    }

    /// Decode a BgpRx/BgpTx code back into (major, minor).
    pub fn bgp_code_subcode(&self) -> Option<(u8, u8)> {
        match self.class {
            ErrorClass::BgpRx | ErrorClass::BgpTx => {
                Some(((self.code >> 16) as u8, (self.code & 0xffff) as u8))
            }
            _ => None,
        }
    }

    /// The "<class-prefix><message>" half of the status string (§6).
    pub fn describe(&self) -> String {
        match self.class {
            ErrorClass::None => String::new(),
            ErrorClass::Misc => match self.code {
                c if c == MiscReason::NeighborLost as u32 => "Neighbor lost".to_string(),
                c if c == MiscReason::InvalidNextHop as u32 => "Invalid next hop".to_string(),
                c if c == MiscReason::InvalidMd5 as u32 => "Invalid MD5 key".to_string(),
                _ => "Misc error".to_string(),
            },
            ErrorClass::Socket => format!("Socket error: errno {}", self.code),
            ErrorClass::BgpRx => {
                let (code, sub) = self.bgp_code_subcode().unwrap_or((0, 0));
                format!("Received: NOTIFICATION ({}, {})", code, sub)
            }
            ErrorClass::BgpTx => {
                let (code, sub) = self.bgp_code_subcode().unwrap_or((0, 0));
                format!("Unexpected close: NOTIFICATION ({}, {})", code, sub)
            }
            ErrorClass::AutoDown => match self.code {
                c if c == AutoDownReason::RouteLimitExceeded as u32 => {
                    "Automatic shutdown: Route limit exceeded".to_string()
                }
                _ => "Automatic shutdown".to_string(),
            },
            ErrorClass::ManDown => "Administratively shut down".to_string(),
        }
    }
}

impl Default for LastError {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Error surfaced from the methods that drive a [`crate::connection::Connection`].
///
/// This is the `?`-propagated counterpart to [`LastError`]: the connection's
/// driving loop matches on it once, converts it into the right NOTIFICATION
/// and `LastError`, and the `EngineError` itself is then dropped.
#[derive(Debug)]
pub enum EngineError {
    /// Transport-level failure (read/write/connect).
    Transport(io::Error),
    /// Locally detected FSM violation, `(code, subcode)` per RFC 4271 §6.
    FiniteStateMachine(u8, u8),
    /// Hold timer expired while established or negotiating.
    HoldTimeExpired,
    /// Peer's OPEN advertised an unexpected remote AS.
    OpenAsnMismatch { received: u32, expected: u32 },
    /// Peer sent a NOTIFICATION; carries the `(code, subcode)` it reported.
    PeerNotified(u8, u8),
    /// Peer was de-configured out from under a running session.
    Deconfigured,
    /// Anything else worth a message but not its own variant.
    Other(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::Transport(e) => write!(f, "transport error: {}", e),
            EngineError::FiniteStateMachine(code, sub) => {
                write!(f, "FSM error ({}, {})", code, sub)
            }
            EngineError::HoldTimeExpired => write!(f, "hold timer expired"),
            EngineError::OpenAsnMismatch { received, expected } => write!(
                f,
                "OPEN ASN mismatch (received={}, expected={})",
                received, expected
            ),
            EngineError::PeerNotified(code, sub) => {
                write!(f, "peer sent NOTIFICATION ({}, {})", code, sub)
            }
            EngineError::Deconfigured => write!(f, "peer de-configured"),
            EngineError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgp_tx_packs_code_and_subcode() {
        let err = LastError::bgp_tx(4, 0);
        assert_eq!(err.bgp_code_subcode(), Some((4, 0)));
        let err = LastError::bgp_tx(6, 7);
        assert_eq!(err.bgp_code_subcode(), Some((6, 7)));
    }

    #[test]
    fn route_limit_status_matches_spec_s4() {
        let err = LastError::auto_down(AutoDownReason::RouteLimitExceeded);
        assert_eq!(err.describe(), "Automatic shutdown: Route limit exceeded");
    }

    #[test]
    fn none_describes_as_empty() {
        assert_eq!(LastError::none().describe(), "");
    }
}
