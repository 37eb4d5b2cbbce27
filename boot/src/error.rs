/// Bootstrap error taxonomy.
///
/// Provider absence is not an error - probes return `Option` and the
/// sequencer falls through to the next provider. Everything that *is* an
/// error ends the VCPI path or the whole bootstrap, depending on how far
/// negotiation got (see the sequencer).
use core::fmt;

/// Upper bound on hardware-handshake busy-wait polls (keyboard controller
/// status bits, EMS/XMS allocation retries). The original protocol has no
/// bound at all; exceeding this limit reports `BootError::Timeout` instead
/// of hanging. The free-interrupt-vector scan is deliberately *not* run
/// under this limit - see vcpi/irq.rs.
pub const HANDSHAKE_POLL_LIMIT: u32 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// A host resource ran out (low DOS memory, EMS page, free vector
    /// window). Fatal to the VCPI path before a permanent mapping exists,
    /// fatal to the whole bootstrap afterwards.
    ResourceExhausted(&'static str),
    /// The host claimed success but a postcondition failed (wrong
    /// descriptor flags, bad identity mapping, out-of-range vector
    /// window). Always fatal: continuing risks silent memory corruption.
    ProtocolViolation(&'static str),
    /// A bounded hardware handshake did not complete within
    /// `HANDSHAKE_POLL_LIMIT` polls.
    Timeout(&'static str),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::ResourceExhausted(what) => write!(f, "resource exhausted: {}", what),
            BootError::ProtocolViolation(what) => write!(f, "host protocol violation: {}", what),
            BootError::Timeout(what) => write!(f, "hardware handshake timeout: {}", what),
        }
    }
}
