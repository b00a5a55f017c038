//! Pairing escalation
//!
//! Tries an unprotected pairing first and only escalates to an encrypted
//! one when the first attempt did not succeed.

use crate::domain::diagnostics::{DiagnosticsBuilder, PairingAttempt, PairingView};
use crate::domain::error::BleError;
use crate::domain::models::{PairingOutcome, ProtectionLevel};
use crate::infrastructure::bluetooth::platform::{cancellable, PairingCapability};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Levels tried by [`ensure_paired`], in order
pub const ESCALATION: [ProtectionLevel; 2] = [ProtectionLevel::None, ProtectionLevel::Encryption];

/// Read the pairing state of a capability
pub fn read_view(pairing: &dyn PairingCapability) -> PairingView {
    PairingView {
        id: pairing.id(),
        is_paired: pairing.is_paired(),
        can_pair: pairing.can_pair(),
    }
}

/// Make sure the device behind `pairing` is paired.
///
/// Returns without attempting anything when the capability is missing, the
/// device is already paired, or the platform says it cannot pair.
/// `AccessDenied` aborts with [`BleError::Unauthorized`]; exhausting the
/// escalation yields [`BleError::PairingFailed`] with the last outcome.
pub async fn ensure_paired(
    pairing: Option<&dyn PairingCapability>,
    cancel: &CancellationToken,
    diagnostics: &mut DiagnosticsBuilder,
) -> Result<PairingAttempt, BleError> {
    let Some(pairing) = pairing else {
        diagnostics.note("Pairing capability unavailable.");
        return Ok(PairingAttempt::not_attempted(false));
    };

    let view = read_view(pairing);
    if view.is_paired.is_true() {
        diagnostics.note("Device is already paired.");
        return Ok(PairingAttempt::not_attempted(true));
    }
    if !view.can_pair.is_true() {
        diagnostics.note(format!(
            "Device is not paired and cannot pair (CanPair: {}).",
            view.can_pair
        ));
        return Ok(PairingAttempt::not_attempted(false));
    }

    let mut last = PairingOutcome::Unknown;
    for level in ESCALATION {
        let outcome = cancellable(cancel, pairing.pair(level)).await?;
        info!("Pairing {} using {} returned {}", view.id, level, outcome);
        diagnostics.note(format!(
            "Pairing attempt using {} returned {}.",
            level, outcome
        ));

        if outcome == PairingOutcome::AccessDenied {
            warn!("Pairing {} was refused by the platform", view.id);
            return Err(BleError::Unauthorized(format!(
                "Pairing using {} was denied.",
                level
            )));
        }

        let attempt = PairingAttempt::attempted(outcome, level);
        if attempt.succeeded {
            return Ok(attempt);
        }
        last = outcome;
    }

    Err(BleError::PairingFailed(last))
}
