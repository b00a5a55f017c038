//! Connection diagnostics accumulation.
//!
//! A [`DiagnosticsBuilder`] lives for the duration of one connect call,
//! including the alternate-discovery round, and is consumed into an
//! immutable [`ConnectionDiagnostics`].

use crate::domain::models::{
    ConnectionDiagnostics, ConnectionStatus, PairingOutcome, ProtectionLevel, TriState,
};

/// Pairing state read from a pairing capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingView {
    pub id: String,
    pub is_paired: TriState,
    pub can_pair: TriState,
}

/// What the escalation did for one device record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingAttempt {
    pub attempted: bool,
    pub succeeded: bool,
    pub outcome: Option<PairingOutcome>,
    pub level: Option<ProtectionLevel>,
}

impl PairingAttempt {
    pub fn not_attempted(succeeded: bool) -> Self {
        Self {
            attempted: false,
            succeeded,
            outcome: None,
            level: None,
        }
    }

    pub fn attempted(outcome: PairingOutcome, level: ProtectionLevel) -> Self {
        Self {
            attempted: true,
            succeeded: outcome.is_success(),
            outcome: Some(outcome),
            level: Some(level),
        }
    }

    /// Pairing was performed during this call and it worked
    pub fn paired_now(&self) -> bool {
        self.attempted && self.succeeded
    }
}

#[derive(Debug, Default)]
pub struct DiagnosticsBuilder {
    platform_id: Option<String>,
    initial_is_paired: TriState,
    initial_can_pair: TriState,
    final_is_paired: TriState,
    final_can_pair: TriState,
    pairing_attempted: bool,
    pairing_outcome: Option<PairingOutcome>,
    protection_level: Option<ProtectionLevel>,
    connection_status: ConnectionStatus,
    notes: Vec<String>,
}

impl DiagnosticsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value wins
    pub fn set_platform_id(&mut self, id: impl Into<String>) {
        if self.platform_id.is_none() {
            let id = id.into();
            if !id.trim().is_empty() {
                self.platform_id = Some(id);
            }
        }
    }

    /// Only fills values that are still unknown
    pub fn set_initial(&mut self, view: Option<&PairingView>) {
        let Some(view) = view else {
            return;
        };
        if !self.initial_is_paired.is_known() {
            self.initial_is_paired = view.is_paired;
        }
        if !self.initial_can_pair.is_known() {
            self.initial_can_pair = view.can_pair;
        }
    }

    /// Absent view falls back to the initial snapshot
    pub fn set_final(&mut self, view: Option<&PairingView>) {
        match view {
            Some(view) => {
                self.final_is_paired = view.is_paired;
                self.final_can_pair = view.can_pair;
            }
            None => {
                if !self.final_is_paired.is_known() {
                    self.final_is_paired = self.initial_is_paired;
                }
                if !self.final_can_pair.is_known() {
                    self.final_can_pair = self.initial_can_pair;
                }
            }
        }
    }

    pub fn record_attempt(&mut self, attempt: &PairingAttempt) {
        if attempt.attempted {
            self.pairing_attempted = true;
            self.pairing_outcome = attempt.outcome;
            self.protection_level = attempt.level;
        }
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        self.connection_status = status;
    }

    /// Blank notes are dropped
    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !note.trim().is_empty() {
            self.notes.push(note);
        }
    }

    pub fn build(mut self) -> ConnectionDiagnostics {
        self.notes.push(format!(
            "Pairing state before connect - IsPaired: {}, CanPair: {}",
            self.initial_is_paired, self.initial_can_pair
        ));
        self.notes.push(format!(
            "Pairing state after connect - IsPaired: {}, CanPair: {}",
            self.final_is_paired, self.final_can_pair
        ));
        self.notes
            .push(format!("ConnectionStatus: {}", self.connection_status));
        if self.pairing_attempted {
            let outcome = self
                .pairing_outcome
                .map(|o| o.to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            let level = self
                .protection_level
                .map(|l| l.to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            self.notes.push(format!(
                "Pairing attempt result: {} (Protection: {})",
                outcome, level
            ));
        }

        ConnectionDiagnostics {
            platform_id: self.platform_id,
            initial_is_paired: self.initial_is_paired,
            initial_can_pair: self.initial_can_pair,
            final_is_paired: self.final_is_paired,
            final_can_pair: self.final_can_pair,
            pairing_attempted: self.pairing_attempted,
            pairing_outcome: self.pairing_outcome,
            protection_level: self.protection_level,
            connection_status: self.connection_status,
            notes: self.notes,
        }
    }
}
