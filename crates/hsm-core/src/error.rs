use thiserror::Error;

use crate::attributes::AttributeId;

pub type HsmResult<T> = Result<T, HsmError>;

/// Failures raised by the software token. Each variant corresponds to exactly one
/// PKCS#11 return code at the C boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HsmError {
    #[error("session {0} does not exist")]
    SessionHandleInvalid(u64),
    #[error("session is read-only")]
    SessionReadOnly,
    #[error("user not logged in")]
    UserNotLoggedIn,
    #[error("user already logged in")]
    UserAlreadyLoggedIn,
    #[error("object {0} does not exist")]
    ObjectHandleInvalid(u64),
    #[error("key {0} does not exist")]
    KeyHandleInvalid(u64),
    #[error("wrapping key {0} does not exist")]
    WrappingKeyHandleInvalid(u64),
    #[error("unwrapping key {0} does not exist")]
    UnwrappingKeyHandleInvalid(u64),
    #[error("an operation of this kind is already active")]
    OperationActive,
    #[error("operation not initialized")]
    OperationNotInitialized,
    #[error("mechanism {0:#x} is not supported")]
    MechanismInvalid(u64),
    #[error("invalid mechanism parameter: {0}")]
    MechanismParamInvalid(String),
    #[error("key type inconsistent with mechanism")]
    KeyTypeInconsistent,
    #[error("key does not permit this function")]
    KeyFunctionNotPermitted,
    #[error("key is not extractable")]
    KeyUnextractable,
    #[error("key cannot be wrapped")]
    KeyNotWrappable,
    #[error("key size {0} out of range")]
    KeySizeRange(usize),
    #[error("template incomplete: missing attribute {0:#x}")]
    TemplateIncomplete(AttributeId),
    #[error("template inconsistent: {0}")]
    TemplateInconsistent(String),
    #[error("attribute {0:#x} is read-only")]
    AttributeReadOnly(AttributeId),
    #[error("attribute type {0:#x} is invalid")]
    AttributeTypeInvalid(AttributeId),
    #[error("attribute {0:#x} has an invalid value")]
    AttributeValueInvalid(AttributeId),
    #[error("data length out of range")]
    DataLenRange,
    #[error("encrypted data is invalid")]
    EncryptedDataInvalid,
    #[error("encrypted data length out of range")]
    EncryptedDataLenRange,
    #[error("wrapped key is invalid")]
    WrappedKeyInvalid,
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl HsmError {
    pub fn crypto<E: std::fmt::Display>(err: E) -> Self {
        Self::Crypto(err.to_string())
    }

    pub fn inconsistent<E: std::fmt::Display>(err: E) -> Self {
        Self::TemplateInconsistent(err.to_string())
    }

    pub fn param<E: std::fmt::Display>(err: E) -> Self {
        Self::MechanismParamInvalid(err.to_string())
    }
}
