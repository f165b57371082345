use cryptoki_sys::CK_OBJECT_CLASS;
use thiserror::Error;

use crate::{
    attribute::{AttributeKind, AttributeType},
    mechanism::{MechanismType, ParameterKind},
    object::ObjectKind,
    operation::OperationKind,
    rv::{Outcome, ReturnCode},
};

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure surfaced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected locally before any native call was made.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// The native module returned a failure code.
    #[error("{function} failed with {rv}")]
    Protocol {
        function: &'static str,
        rv: ReturnCode,
        /// Operation slot left active by the failure; call `abort` to release it.
        pending: Option<OperationKind>,
    },
    /// Operation state machine misuse.
    #[error(transparent)]
    Sequencing(#[from] SequencingError),
}

impl Error {
    pub(crate) fn protocol(
        function: &'static str,
        rv: ReturnCode,
        pending: Option<OperationKind>,
    ) -> Self {
        Self::Protocol {
            function,
            rv,
            pending,
        }
    }

    /// Classified native outcome, for protocol failures only.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Protocol { rv, .. } => Some(rv.classify()),
            _ => None,
        }
    }

    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            Self::Protocol { rv, .. } => Some(*rv),
            _ => None,
        }
    }

    pub fn pending_operation(&self) -> Option<OperationKind> {
        match self {
            Self::Protocol { pending, .. } => *pending,
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.outcome().is_some_and(Outcome::is_retryable)
    }

    pub fn is_permission_denied(&self) -> bool {
        self.outcome().is_some_and(Outcome::is_permission_denied)
    }

    pub fn is_argument_invalid(&self) -> bool {
        self.outcome().is_some_and(Outcome::is_argument_invalid)
    }

    pub fn is_device_fault(&self) -> bool {
        self.outcome().is_some_and(Outcome::is_device_fault)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{attribute} expects a {expected} value, got {actual}")]
    KindMismatch {
        attribute: AttributeType,
        expected: AttributeKind,
        actual: AttributeKind,
    },
    #[error("{attribute} is malformed: {reason}")]
    MalformedValue {
        attribute: AttributeType,
        reason: &'static str,
    },
    #[error("{kind} object requires {attribute}")]
    MissingAttribute {
        kind: ObjectKind,
        attribute: AttributeType,
    },
    #[error("object class {actual:#x} does not describe a {expected} object")]
    ClassMismatch {
        expected: ObjectKind,
        actual: CK_OBJECT_CLASS,
    },
    #[error("{mechanism} takes {expected} parameters")]
    ParameterMismatch {
        mechanism: MechanismType,
        expected: ParameterKind,
    },
    #[error("{mechanism} needs a {expected}-byte IV, got {actual} bytes")]
    IvLength {
        mechanism: MechanismType,
        expected: usize,
        actual: usize,
    },
    #[error("{mechanism} parameter is invalid: {reason}")]
    MalformedParameter {
        mechanism: MechanismType,
        reason: &'static str,
    },
    #[error("{mechanism} cannot be used to {usage}")]
    MechanismNotPermitted {
        mechanism: MechanismType,
        usage: &'static str,
    },
    #[error("{0} needs a key")]
    MissingKey(OperationKind),
    #[error("{0} does not take a key")]
    UnexpectedKey(OperationKind),
    #[error("{attribute} cannot be read through a byte buffer")]
    UnsupportedQuery { attribute: AttributeType },
    #[error("native length {length} exceeds the configured limit of {limit} bytes")]
    LengthLimit { length: u64, limit: usize },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SequencingError {
    #[error("no {0} operation is active")]
    NotInitialized(OperationKind),
    #[error("a {0} operation is already active")]
    AlreadyActive(OperationKind),
    #[error("{0} has no streaming form")]
    NotStreaming(OperationKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::{CKR_DEVICE_ERROR, CKR_KEY_UNEXTRACTABLE};

    #[test]
    fn protocol_errors_expose_classification() {
        let err = Error::protocol("C_WrapKey", ReturnCode::new(CKR_KEY_UNEXTRACTABLE), None);
        assert!(err.is_permission_denied());
        assert!(!err.is_retryable());
        assert_eq!(err.pending_operation(), None);
        assert_eq!(
            err.to_string(),
            "C_WrapKey failed with CKR_KEY_UNEXTRACTABLE (0x6a)"
        );
    }

    #[test]
    fn pending_slot_is_reported() {
        let err = Error::protocol(
            "C_EncryptUpdate",
            ReturnCode::new(CKR_DEVICE_ERROR),
            Some(OperationKind::Encrypt),
        );
        assert!(err.is_device_fault());
        assert_eq!(err.pending_operation(), Some(OperationKind::Encrypt));
    }

    #[test]
    fn local_errors_have_no_outcome() {
        let err = Error::from(SequencingError::NotInitialized(OperationKind::Sign));
        assert_eq!(err.outcome(), None);
        assert_eq!(err.to_string(), "no sign operation is active");
    }
}
