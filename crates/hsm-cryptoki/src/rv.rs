//! Translation of native `CK_RV` return codes into classified outcomes.

use cryptoki_sys::*;
use std::fmt;

/// A raw return code as produced by the native module.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnCode(CK_RV);

/// Classified result of a native call. Every failure keeps its originating code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transient condition; the caller may re-open a session and try again.
    Retryable(ReturnCode),
    /// The token refused the request for policy or authentication reasons.
    PermissionDenied(ReturnCode),
    /// Bad template, mechanism, key, data or buffer for this call.
    ArgumentInvalid(ReturnCode),
    /// Device error, missing token, missing function or an unknown code.
    DeviceFault(ReturnCode),
}

#[derive(Clone, Copy)]
enum Class {
    Success,
    Retryable,
    PermissionDenied,
    ArgumentInvalid,
    DeviceFault,
}

macro_rules! return_codes {
    ($($code:ident => $class:ident),* $(,)?) => {
        static RETURN_CODES: &[(CK_RV, &str, Class)] = &[
            $(($code, stringify!($code), Class::$class)),*
        ];
    };
}

return_codes! {
    CKR_OK => Success,

    CKR_SESSION_HANDLE_INVALID => Retryable,
    CKR_SESSION_CLOSED => Retryable,
    CKR_SESSION_COUNT => Retryable,
    CKR_FUNCTION_CANCELED => Retryable,
    CKR_CRYPTOKI_NOT_INITIALIZED => Retryable,
    CKR_CANT_LOCK => Retryable,

    CKR_KEY_UNEXTRACTABLE => PermissionDenied,
    CKR_KEY_NOT_WRAPPABLE => PermissionDenied,
    CKR_KEY_FUNCTION_NOT_PERMITTED => PermissionDenied,
    CKR_USER_NOT_LOGGED_IN => PermissionDenied,
    CKR_USER_PIN_NOT_INITIALIZED => PermissionDenied,
    CKR_ATTRIBUTE_SENSITIVE => PermissionDenied,
    CKR_INFORMATION_SENSITIVE => PermissionDenied,
    CKR_SESSION_READ_ONLY => PermissionDenied,
    CKR_TOKEN_WRITE_PROTECTED => PermissionDenied,
    CKR_ACTION_PROHIBITED => PermissionDenied,
    CKR_FUNCTION_REJECTED => PermissionDenied,
    CKR_PIN_INCORRECT => PermissionDenied,
    CKR_PIN_EXPIRED => PermissionDenied,
    CKR_PIN_LOCKED => PermissionDenied,

    CKR_ARGUMENTS_BAD => ArgumentInvalid,
    CKR_SLOT_ID_INVALID => ArgumentInvalid,
    CKR_USER_TYPE_INVALID => ArgumentInvalid,
    CKR_USER_ALREADY_LOGGED_IN => ArgumentInvalid,
    CKR_ATTRIBUTE_READ_ONLY => ArgumentInvalid,
    CKR_ATTRIBUTE_TYPE_INVALID => ArgumentInvalid,
    CKR_ATTRIBUTE_VALUE_INVALID => ArgumentInvalid,
    CKR_TEMPLATE_INCOMPLETE => ArgumentInvalid,
    CKR_TEMPLATE_INCONSISTENT => ArgumentInvalid,
    CKR_MECHANISM_INVALID => ArgumentInvalid,
    CKR_MECHANISM_PARAM_INVALID => ArgumentInvalid,
    CKR_KEY_HANDLE_INVALID => ArgumentInvalid,
    CKR_KEY_SIZE_RANGE => ArgumentInvalid,
    CKR_KEY_TYPE_INCONSISTENT => ArgumentInvalid,
    CKR_OBJECT_HANDLE_INVALID => ArgumentInvalid,
    CKR_OPERATION_ACTIVE => ArgumentInvalid,
    CKR_OPERATION_NOT_INITIALIZED => ArgumentInvalid,
    CKR_DATA_INVALID => ArgumentInvalid,
    CKR_DATA_LEN_RANGE => ArgumentInvalid,
    CKR_ENCRYPTED_DATA_INVALID => ArgumentInvalid,
    CKR_ENCRYPTED_DATA_LEN_RANGE => ArgumentInvalid,
    CKR_SIGNATURE_INVALID => ArgumentInvalid,
    CKR_SIGNATURE_LEN_RANGE => ArgumentInvalid,
    CKR_WRAPPED_KEY_INVALID => ArgumentInvalid,
    CKR_WRAPPED_KEY_LEN_RANGE => ArgumentInvalid,
    CKR_WRAPPING_KEY_HANDLE_INVALID => ArgumentInvalid,
    CKR_WRAPPING_KEY_SIZE_RANGE => ArgumentInvalid,
    CKR_WRAPPING_KEY_TYPE_INCONSISTENT => ArgumentInvalid,
    CKR_UNWRAPPING_KEY_HANDLE_INVALID => ArgumentInvalid,
    CKR_UNWRAPPING_KEY_SIZE_RANGE => ArgumentInvalid,
    CKR_UNWRAPPING_KEY_TYPE_INCONSISTENT => ArgumentInvalid,
    CKR_DOMAIN_PARAMS_INVALID => ArgumentInvalid,
    CKR_CURVE_NOT_SUPPORTED => ArgumentInvalid,
    CKR_BUFFER_TOO_SMALL => ArgumentInvalid,

    CKR_GENERAL_ERROR => DeviceFault,
    CKR_FUNCTION_FAILED => DeviceFault,
    CKR_HOST_MEMORY => DeviceFault,
    CKR_DEVICE_ERROR => DeviceFault,
    CKR_DEVICE_MEMORY => DeviceFault,
    CKR_DEVICE_REMOVED => DeviceFault,
    CKR_TOKEN_NOT_PRESENT => DeviceFault,
    CKR_TOKEN_NOT_RECOGNIZED => DeviceFault,
    CKR_FUNCTION_NOT_SUPPORTED => DeviceFault,
    CKR_RANDOM_NO_RNG => DeviceFault,
}

impl ReturnCode {
    pub const OK: Self = Self(CKR_OK);

    pub const fn new(rv: CK_RV) -> Self {
        Self(rv)
    }

    pub const fn raw(self) -> CK_RV {
        self.0
    }

    fn lookup(self) -> Option<&'static (CK_RV, &'static str, Class)> {
        RETURN_CODES.iter().find(|(code, _, _)| *code == self.0)
    }

    /// Symbolic `CKR_*` name for codes this crate knows about.
    pub fn name(self) -> Option<&'static str> {
        self.lookup().map(|(_, name, _)| *name)
    }

    pub fn is_ok(self) -> bool {
        self.0 == CKR_OK
    }

    pub fn is_vendor_defined(self) -> bool {
        self.0 & CKR_VENDOR_DEFINED != 0
    }

    /// Total mapping from code to outcome; unknown and vendor codes are device
    /// faults.
    pub fn classify(self) -> Outcome {
        match self.lookup().map(|(_, _, class)| *class) {
            Some(Class::Success) => Outcome::Success,
            Some(Class::Retryable) => Outcome::Retryable(self),
            Some(Class::PermissionDenied) => Outcome::PermissionDenied(self),
            Some(Class::ArgumentInvalid) => Outcome::ArgumentInvalid(self),
            Some(Class::DeviceFault) | None => Outcome::DeviceFault(self),
        }
    }
}

impl From<CK_RV> for ReturnCode {
    fn from(rv: CK_RV) -> Self {
        Self(rv)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#x})", self.0),
            None if self.is_vendor_defined() => write!(f, "vendor-defined return code {:#x}", self.0),
            None => write!(f, "unknown return code {:#x}", self.0),
        }
    }
}

impl fmt::Debug for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn is_permission_denied(self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    pub fn is_argument_invalid(self) -> bool {
        matches!(self, Self::ArgumentInvalid(_))
    }

    pub fn is_device_fault(self) -> bool {
        matches!(self, Self::DeviceFault(_))
    }

    pub fn return_code(self) -> ReturnCode {
        match self {
            Self::Success => ReturnCode::OK,
            Self::Retryable(rv)
            | Self::PermissionDenied(rv)
            | Self::ArgumentInvalid(rv)
            | Self::DeviceFault(rv) => rv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representative_codes_classify() {
        assert_eq!(ReturnCode::OK.classify(), Outcome::Success);
        assert!(ReturnCode::new(CKR_KEY_UNEXTRACTABLE).classify().is_permission_denied());
        assert!(ReturnCode::new(CKR_USER_NOT_LOGGED_IN).classify().is_permission_denied());
        assert!(ReturnCode::new(CKR_SESSION_HANDLE_INVALID).classify().is_retryable());
        assert!(ReturnCode::new(CKR_BUFFER_TOO_SMALL).classify().is_argument_invalid());
        assert!(ReturnCode::new(CKR_TEMPLATE_INCONSISTENT).classify().is_argument_invalid());
        assert!(ReturnCode::new(CKR_DEVICE_ERROR).classify().is_device_fault());
        assert!(ReturnCode::new(CKR_TOKEN_NOT_PRESENT).classify().is_device_fault());
    }

    #[test]
    fn unknown_and_vendor_codes_are_device_faults() {
        let vendor = ReturnCode::new(CKR_VENDOR_DEFINED | 0x17);
        assert_eq!(vendor.classify(), Outcome::DeviceFault(vendor));
        assert!(vendor.to_string().starts_with("vendor-defined"));

        let unknown = ReturnCode::new(0x0FFF_FFF0);
        assert_eq!(unknown.classify(), Outcome::DeviceFault(unknown));
        assert_eq!(unknown.name(), None);
    }

    #[test]
    fn failures_keep_their_code() {
        let rv = ReturnCode::new(CKR_KEY_UNEXTRACTABLE);
        assert_eq!(rv.classify().return_code(), rv);
        assert_eq!(rv.to_string(), "CKR_KEY_UNEXTRACTABLE (0x6a)");
    }
}
