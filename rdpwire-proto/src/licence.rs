//! Licensing collaborator.
//!
//! The licensing sub-protocol itself lives outside this crate. The security
//! layer hands every `SEC_LICENSE_PKT` payload to a [`Licensing`]
//! implementation and sends back whatever reply it produces.

use crate::cursor::ByteCursor;
use crate::error::Result;

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Result of processing one licensing PDU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LicenceOutcome {
    /// Licensing PDU to send back to the server (without security header).
    pub reply:     Option<Vec<u8>>,
    /// Licensing finished; the security header may be dropped on
    /// unencrypted sessions from now on.
    pub completed: bool,
}

/// Handles licensing PDUs on the global channel.
pub trait Licensing {
    /// Process one licensing PDU. `s` starts at the preamble.
    fn process(&mut self, s: &mut ByteCursor) -> Result<LicenceOutcome>;
}

// ─── ValidClientOnly ─────────────────────────────────────────────────────────

const LICENSE_REQUEST:    u8 = 0x01;
const PLATFORM_CHALLENGE: u8 = 0x02;
const NEW_LICENSE:        u8 = 0x03;
const UPGRADE_LICENSE:    u8 = 0x04;
const ERROR_ALERT:        u8 = 0xff;

const STATUS_VALID_CLIENT: u32 = 0x0000_0007;

/// Accepts the server's "valid client" short-cut and issued licences;
/// does not take part in a full licence exchange.
#[derive(Debug, Default)]
pub struct ValidClientOnly;

impl Licensing for ValidClientOnly {
    fn process(&mut self, s: &mut ByteCursor) -> Result<LicenceOutcome> {
        let msg_type = s.read_u8()?;
        let _flags = s.read_u8()?;
        let _size = s.read_u16_le()?;

        let completed = match msg_type {
            ERROR_ALERT => {
                let code = s.read_u32_le()?;
                let transition = s.read_u32_le()?;
                if code != STATUS_VALID_CLIENT {
                    log::warn!("licence error alert {code:#x} (state transition {transition})");
                }
                code == STATUS_VALID_CLIENT
            }
            NEW_LICENSE | UPGRADE_LICENSE => {
                log::info!("server issued a licence");
                true
            }
            LICENSE_REQUEST | PLATFORM_CHALLENGE => {
                log::warn!("licence exchange {msg_type:#04x} requested; no licensing backend configured");
                false
            }
            other => {
                log::debug!("unknown licensing message {other:#04x}");
                false
            }
        };
        Ok(LicenceOutcome { reply: None, completed })
    }
}
