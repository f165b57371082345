//! Per-session operation slots.
//!
//! A session may run one operation of each kind at a time. Each slot moves
//! `Idle -> Initialized -> InProgress* -> Idle`; anything else is a sequencing error.

use std::fmt;

use crate::{error::SequencingError, mechanism::MechanismUsage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    Sign,
    Digest,
    Find,
}

impl OperationKind {
    pub const ALL: [Self; 5] = [
        Self::Encrypt,
        Self::Decrypt,
        Self::Sign,
        Self::Digest,
        Self::Find,
    ];

    const fn index(self) -> usize {
        match self {
            Self::Encrypt => 0,
            Self::Decrypt => 1,
            Self::Sign => 2,
            Self::Digest => 3,
            Self::Find => 4,
        }
    }

    /// Mechanism capability required to initialize this kind.
    pub fn required_usage(self) -> Option<MechanismUsage> {
        match self {
            Self::Encrypt => Some(MechanismUsage::ENCRYPT),
            Self::Decrypt => Some(MechanismUsage::DECRYPT),
            Self::Sign => Some(MechanismUsage::SIGN),
            Self::Digest => Some(MechanismUsage::DIGEST),
            Self::Find => None,
        }
    }

    pub fn needs_key(self) -> bool {
        matches!(self, Self::Encrypt | Self::Decrypt | Self::Sign)
    }

    pub fn is_cryptographic(self) -> bool {
        !matches!(self, Self::Find)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Sign => "sign",
            Self::Digest => "digest",
            Self::Find => "find",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperationState {
    #[default]
    Idle,
    Initialized,
    InProgress,
}

#[derive(Clone, Debug, Default)]
pub struct OperationSlots {
    states: [OperationState; OperationKind::ALL.len()],
}

impl OperationSlots {
    pub fn state(&self, kind: OperationKind) -> OperationState {
        self.states[kind.index()]
    }

    pub fn is_idle(&self, kind: OperationKind) -> bool {
        self.state(kind) == OperationState::Idle
    }

    pub fn active(&self) -> impl Iterator<Item = OperationKind> + '_ {
        OperationKind::ALL
            .into_iter()
            .filter(|kind| !self.is_idle(*kind))
    }

    /// Idle -> Initialized.
    pub(crate) fn begin(&mut self, kind: OperationKind) -> Result<(), SequencingError> {
        if !self.is_idle(kind) {
            return Err(SequencingError::AlreadyActive(kind));
        }
        self.states[kind.index()] = OperationState::Initialized;
        Ok(())
    }

    pub(crate) fn ensure_active(&self, kind: OperationKind) -> Result<(), SequencingError> {
        if self.is_idle(kind) {
            Err(SequencingError::NotInitialized(kind))
        } else {
            Ok(())
        }
    }

    /// Initialized|InProgress -> InProgress.
    pub(crate) fn advance(&mut self, kind: OperationKind) -> Result<(), SequencingError> {
        self.ensure_active(kind)?;
        self.states[kind.index()] = OperationState::InProgress;
        Ok(())
    }

    pub(crate) fn reset(&mut self, kind: OperationKind) {
        self.states[kind.index()] = OperationState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_follow_the_state_machine() {
        let mut slots = OperationSlots::default();
        assert_eq!(
            slots.advance(OperationKind::Encrypt),
            Err(SequencingError::NotInitialized(OperationKind::Encrypt))
        );
        slots.begin(OperationKind::Encrypt).unwrap();
        assert_eq!(slots.state(OperationKind::Encrypt), OperationState::Initialized);
        assert_eq!(
            slots.begin(OperationKind::Encrypt),
            Err(SequencingError::AlreadyActive(OperationKind::Encrypt))
        );
        slots.advance(OperationKind::Encrypt).unwrap();
        slots.advance(OperationKind::Encrypt).unwrap();
        assert_eq!(slots.state(OperationKind::Encrypt), OperationState::InProgress);
        slots.reset(OperationKind::Encrypt);
        assert!(slots.is_idle(OperationKind::Encrypt));
    }

    #[test]
    fn kinds_are_independent() {
        let mut slots = OperationSlots::default();
        slots.begin(OperationKind::Encrypt).unwrap();
        slots.begin(OperationKind::Digest).unwrap();
        assert_eq!(
            slots.active().collect::<Vec<_>>(),
            vec![OperationKind::Encrypt, OperationKind::Digest]
        );
        assert!(slots.is_idle(OperationKind::Decrypt));
    }
}
