//! PKCS#11 attribute types and typed attribute values.
//!
//! Every known `CKA_*` code is registered once in a static table together with the
//! value kind the standard assigns to it. Codes outside the table (including the
//! vendor-defined range) are carried as opaque integers and accept any kind.

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_MECHANISM_TYPE, CK_ULONG, CKA_ALLOWED_MECHANISMS,
    CKA_ALWAYS_AUTHENTICATE, CKA_ALWAYS_SENSITIVE, CKA_APPLICATION, CKA_BASE,
    CKA_CERTIFICATE_CATEGORY, CKA_CERTIFICATE_TYPE, CKA_CHECK_VALUE, CKA_CLASS, CKA_COPYABLE,
    CKA_DECRYPT, CKA_DERIVE, CKA_DERIVE_TEMPLATE, CKA_DESTROYABLE, CKA_EC_PARAMS, CKA_EC_POINT,
    CKA_ENCRYPT, CKA_END_DATE, CKA_EXTRACTABLE, CKA_ID, CKA_ISSUER, CKA_KEY_GEN_MECHANISM,
    CKA_KEY_TYPE, CKA_LABEL, CKA_LOCAL, CKA_MODIFIABLE, CKA_MODULUS, CKA_MODULUS_BITS,
    CKA_NEVER_EXTRACTABLE, CKA_OBJECT_ID, CKA_PRIME, CKA_PRIVATE, CKA_PRIVATE_EXPONENT,
    CKA_PUBLIC_EXPONENT, CKA_SENSITIVE, CKA_SERIAL_NUMBER, CKA_SIGN, CKA_SIGN_RECOVER,
    CKA_START_DATE, CKA_SUBJECT, CKA_SUBPRIME, CKA_TOKEN, CKA_TRUSTED, CKA_UNIQUE_ID,
    CKA_UNWRAP, CKA_UNWRAP_TEMPLATE, CKA_VALUE, CKA_VALUE_BITS, CKA_VALUE_LEN,
    CKA_VENDOR_DEFINED, CKA_VERIFY, CKA_VERIFY_RECOVER, CKA_WRAP, CKA_WRAP_TEMPLATE,
    CKA_WRAP_WITH_TRUSTED,
};
use std::{fmt, mem};
use time::{Date, Month};

use crate::{error::ValidationError, mechanism::MechanismType, template::Template};

const ULONG_LEN: usize = mem::size_of::<CK_ULONG>();
const MECHANISM_LEN: usize = mem::size_of::<CK_MECHANISM_TYPE>();
const DATE_LEN: usize = 8;

/// Shape of the bytes an attribute carries across the native boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Boolean,
    Integer,
    ByteArray,
    Date,
    MechanismArray,
    AttributeArray,
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::ByteArray => "byte array",
            Self::Date => "date",
            Self::MechanismArray => "mechanism array",
            Self::AttributeArray => "attribute array",
        };
        f.write_str(name)
    }
}

/// A `CK_ATTRIBUTE_TYPE` code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeType(CK_ATTRIBUTE_TYPE);

struct AttributeInfo {
    code: CK_ATTRIBUTE_TYPE,
    name: &'static str,
    kind: AttributeKind,
}

macro_rules! attribute_table {
    ($($name:ident = $code:ident : $kind:ident),* $(,)?) => {
        impl AttributeType {
            $(pub const $name: Self = Self($code);)*
        }

        static ATTRIBUTES: &[AttributeInfo] = &[
            $(AttributeInfo {
                code: $code,
                name: stringify!($code),
                kind: AttributeKind::$kind,
            }),*
        ];
    };
}

attribute_table! {
    CLASS = CKA_CLASS: Integer,
    TOKEN = CKA_TOKEN: Boolean,
    PRIVATE = CKA_PRIVATE: Boolean,
    LABEL = CKA_LABEL: ByteArray,
    UNIQUE_ID = CKA_UNIQUE_ID: ByteArray,
    APPLICATION = CKA_APPLICATION: ByteArray,
    VALUE = CKA_VALUE: ByteArray,
    OBJECT_ID = CKA_OBJECT_ID: ByteArray,
    CERTIFICATE_TYPE = CKA_CERTIFICATE_TYPE: Integer,
    ISSUER = CKA_ISSUER: ByteArray,
    SERIAL_NUMBER = CKA_SERIAL_NUMBER: ByteArray,
    TRUSTED = CKA_TRUSTED: Boolean,
    CERTIFICATE_CATEGORY = CKA_CERTIFICATE_CATEGORY: Integer,
    CHECK_VALUE = CKA_CHECK_VALUE: ByteArray,
    KEY_TYPE = CKA_KEY_TYPE: Integer,
    SUBJECT = CKA_SUBJECT: ByteArray,
    ID = CKA_ID: ByteArray,
    SENSITIVE = CKA_SENSITIVE: Boolean,
    ENCRYPT = CKA_ENCRYPT: Boolean,
    DECRYPT = CKA_DECRYPT: Boolean,
    WRAP = CKA_WRAP: Boolean,
    UNWRAP = CKA_UNWRAP: Boolean,
    SIGN = CKA_SIGN: Boolean,
    SIGN_RECOVER = CKA_SIGN_RECOVER: Boolean,
    VERIFY = CKA_VERIFY: Boolean,
    VERIFY_RECOVER = CKA_VERIFY_RECOVER: Boolean,
    DERIVE = CKA_DERIVE: Boolean,
    START_DATE = CKA_START_DATE: Date,
    END_DATE = CKA_END_DATE: Date,
    MODULUS = CKA_MODULUS: ByteArray,
    MODULUS_BITS = CKA_MODULUS_BITS: Integer,
    PUBLIC_EXPONENT = CKA_PUBLIC_EXPONENT: ByteArray,
    PRIVATE_EXPONENT = CKA_PRIVATE_EXPONENT: ByteArray,
    PRIME = CKA_PRIME: ByteArray,
    SUBPRIME = CKA_SUBPRIME: ByteArray,
    BASE = CKA_BASE: ByteArray,
    VALUE_BITS = CKA_VALUE_BITS: Integer,
    VALUE_LEN = CKA_VALUE_LEN: Integer,
    EXTRACTABLE = CKA_EXTRACTABLE: Boolean,
    LOCAL = CKA_LOCAL: Boolean,
    NEVER_EXTRACTABLE = CKA_NEVER_EXTRACTABLE: Boolean,
    ALWAYS_SENSITIVE = CKA_ALWAYS_SENSITIVE: Boolean,
    KEY_GEN_MECHANISM = CKA_KEY_GEN_MECHANISM: Integer,
    MODIFIABLE = CKA_MODIFIABLE: Boolean,
    COPYABLE = CKA_COPYABLE: Boolean,
    DESTROYABLE = CKA_DESTROYABLE: Boolean,
    EC_PARAMS = CKA_EC_PARAMS: ByteArray,
    EC_POINT = CKA_EC_POINT: ByteArray,
    ALWAYS_AUTHENTICATE = CKA_ALWAYS_AUTHENTICATE: Boolean,
    WRAP_WITH_TRUSTED = CKA_WRAP_WITH_TRUSTED: Boolean,
    WRAP_TEMPLATE = CKA_WRAP_TEMPLATE: AttributeArray,
    UNWRAP_TEMPLATE = CKA_UNWRAP_TEMPLATE: AttributeArray,
    DERIVE_TEMPLATE = CKA_DERIVE_TEMPLATE: AttributeArray,
    ALLOWED_MECHANISMS = CKA_ALLOWED_MECHANISMS: MechanismArray,
}

impl AttributeType {
    pub const fn new(code: CK_ATTRIBUTE_TYPE) -> Self {
        Self(code)
    }

    pub const fn raw(self) -> CK_ATTRIBUTE_TYPE {
        self.0
    }

    fn info(self) -> Option<&'static AttributeInfo> {
        ATTRIBUTES.iter().find(|info| info.code == self.0)
    }

    /// Expected value kind, or `None` for codes this crate does not know.
    pub fn kind(self) -> Option<AttributeKind> {
        self.info().map(|info| info.kind)
    }

    pub fn name(self) -> Option<&'static str> {
        self.info().map(|info| info.name)
    }

    pub fn is_vendor_defined(self) -> bool {
        self.0 & CKA_VENDOR_DEFINED != 0 && self.info().is_none()
    }
}

impl From<CK_ATTRIBUTE_TYPE> for AttributeType {
    fn from(code: CK_ATTRIBUTE_TYPE) -> Self {
        Self(code)
    }
}

impl fmt::Debug for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "CKA_{:#x}", self.0),
        }
    }
}

/// Typed attribute value.
///
/// `Absent` stands for "no value": in a query it asks the token for the value, and
/// in a read result it marks an attribute the token could not or would not return.
/// It is distinct from a present value of length zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
    /// `None` is the empty date a token reports when none was set.
    Date(Option<Date>),
    Mechanisms(Vec<MechanismType>),
    Attributes(Template),
    #[default]
    Absent,
}

impl AttributeValue {
    pub fn kind(&self) -> Option<AttributeKind> {
        match self {
            Self::Bool(_) => Some(AttributeKind::Boolean),
            Self::Ulong(_) => Some(AttributeKind::Integer),
            Self::Bytes(_) => Some(AttributeKind::ByteArray),
            Self::Date(_) => Some(AttributeKind::Date),
            Self::Mechanisms(_) => Some(AttributeKind::MechanismArray),
            Self::Attributes(_) => Some(AttributeKind::AttributeArray),
            Self::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_ulong(&self) -> Option<CK_ULONG> {
        match self {
            Self::Ulong(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<Date> {
        match self {
            Self::Date(value) => *value,
            _ => None,
        }
    }

    pub fn as_mechanisms(&self) -> Option<&[MechanismType]> {
        match self {
            Self::Mechanisms(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_template(&self) -> Option<&Template> {
        match self {
            Self::Attributes(value) => Some(value),
            _ => None,
        }
    }

    /// Native byte encoding of a scalar or flat-array value. Nested attribute arrays
    /// and `Absent` have no byte form and encode as empty.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Bool(value) => vec![u8::from(*value)],
            Self::Ulong(value) => value.to_ne_bytes().to_vec(),
            Self::Bytes(value) => value.clone(),
            Self::Date(None) => Vec::new(),
            Self::Date(Some(date)) => format!(
                "{:04}{:02}{:02}",
                date.year(),
                u8::from(date.month()),
                date.day()
            )
            .into_bytes(),
            Self::Mechanisms(value) => value
                .iter()
                .flat_map(|mechanism| mechanism.raw().to_ne_bytes())
                .collect(),
            Self::Attributes(_) | Self::Absent => Vec::new(),
        }
    }

    /// Inverse of [`AttributeValue::encode`] for the kind registered for `ty`.
    /// Unknown types decode to raw bytes.
    pub fn decode(ty: AttributeType, bytes: &[u8]) -> Result<Self, ValidationError> {
        let malformed = |reason: &'static str| ValidationError::MalformedValue {
            attribute: ty,
            reason,
        };
        match ty.kind() {
            None | Some(AttributeKind::ByteArray) => Ok(Self::Bytes(bytes.to_vec())),
            Some(AttributeKind::Boolean) => match bytes {
                [flag] => Ok(Self::Bool(*flag != 0)),
                _ => Err(malformed("boolean must be a single byte")),
            },
            Some(AttributeKind::Integer) => <[u8; ULONG_LEN]>::try_from(bytes)
                .map(|raw| Self::Ulong(CK_ULONG::from_ne_bytes(raw)))
                .map_err(|_| malformed("integer has the wrong width")),
            Some(AttributeKind::Date) => decode_date(bytes)
                .map(Self::Date)
                .ok_or_else(|| malformed("date must be empty or YYYYMMDD")),
            Some(AttributeKind::MechanismArray) => {
                if bytes.len() % MECHANISM_LEN != 0 {
                    return Err(malformed("mechanism array is not a whole number of entries"));
                }
                Ok(Self::Mechanisms(
                    bytes
                        .chunks_exact(MECHANISM_LEN)
                        .map(|chunk| {
                            let mut raw = [0u8; MECHANISM_LEN];
                            raw.copy_from_slice(chunk);
                            MechanismType::new(CK_MECHANISM_TYPE::from_ne_bytes(raw))
                        })
                        .collect(),
                ))
            }
            Some(AttributeKind::AttributeArray) => {
                Err(malformed("attribute arrays are decoded from CK_ATTRIBUTE records"))
            }
        }
    }
}

fn decode_date(bytes: &[u8]) -> Option<Option<Date>> {
    if bytes.is_empty() || bytes.iter().all(|b| matches!(b, 0 | b'0' | b' ')) {
        return Some(None);
    }
    if bytes.len() != DATE_LEN || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let number = |range: std::ops::Range<usize>| {
        bytes[range]
            .iter()
            .fold(0u32, |acc, digit| acc * 10 + u32::from(digit - b'0'))
    };
    let year = i32::try_from(number(0..4)).ok()?;
    let month = Month::try_from(u8::try_from(number(4..6)).ok()?).ok()?;
    let day = u8::try_from(number(6..8)).ok()?;
    Date::from_calendar_date(year, month, day).ok().map(Some)
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<CK_ULONG> for AttributeValue {
    fn from(value: CK_ULONG) -> Self {
        Self::Ulong(value)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for AttributeValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<Date> for AttributeValue {
    fn from(value: Date) -> Self {
        Self::Date(Some(value))
    }
}

impl From<Vec<MechanismType>> for AttributeValue {
    fn from(value: Vec<MechanismType>) -> Self {
        Self::Mechanisms(value)
    }
}

impl From<Template> for AttributeValue {
    fn from(value: Template) -> Self {
        Self::Attributes(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn known_types_have_kinds_and_names() {
        assert_eq!(AttributeType::VALUE_LEN.kind(), Some(AttributeKind::Integer));
        assert_eq!(AttributeType::WRAP_TEMPLATE.kind(), Some(AttributeKind::AttributeArray));
        assert_eq!(AttributeType::LABEL.name(), Some("CKA_LABEL"));
        assert_eq!(AttributeType::ENCRYPT.to_string(), "CKA_ENCRYPT");
    }

    #[test]
    fn vendor_codes_are_opaque() {
        let vendor = AttributeType::new(CKA_VENDOR_DEFINED | 0x42);
        assert!(vendor.is_vendor_defined());
        assert_eq!(vendor.kind(), None);
        assert!(!AttributeType::WRAP_TEMPLATE.is_vendor_defined());
        assert_eq!(
            AttributeValue::decode(vendor, &[1, 2, 3]).unwrap(),
            AttributeValue::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn scalar_encodings_are_native() {
        assert_eq!(AttributeValue::Bool(true).encode(), vec![1]);
        assert_eq!(AttributeValue::Ulong(16).encode(), (16 as CK_ULONG).to_ne_bytes().to_vec());
        assert_eq!(
            AttributeValue::from(date!(2024 - 02 - 29)).encode(),
            b"20240229".to_vec()
        );
        assert!(AttributeValue::Date(None).encode().is_empty());
    }

    #[test]
    fn decode_rejects_wrong_widths() {
        assert!(matches!(
            AttributeValue::decode(AttributeType::TOKEN, &[1, 0]),
            Err(ValidationError::MalformedValue { .. })
        ));
        assert!(matches!(
            AttributeValue::decode(AttributeType::VALUE_LEN, &[1, 0, 0]),
            Err(ValidationError::MalformedValue { .. })
        ));
        assert!(matches!(
            AttributeValue::decode(AttributeType::START_DATE, b"20241340"),
            Err(ValidationError::MalformedValue { .. })
        ));
    }

    #[test]
    fn empty_and_present_dates_decode() {
        assert_eq!(
            AttributeValue::decode(AttributeType::END_DATE, b"").unwrap(),
            AttributeValue::Date(None)
        );
        assert_eq!(
            AttributeValue::decode(AttributeType::END_DATE, b"19991231").unwrap(),
            AttributeValue::Date(Some(date!(1999 - 12 - 31)))
        );
    }

    #[test]
    fn mechanism_arrays_roundtrip_through_bytes() {
        let value = AttributeValue::Mechanisms(vec![
            MechanismType::AES_CBC_PAD,
            MechanismType::SHA256_HMAC,
        ]);
        let bytes = value.encode();
        assert_eq!(bytes.len(), 2 * MECHANISM_LEN);
        assert_eq!(
            AttributeValue::decode(AttributeType::ALLOWED_MECHANISMS, &bytes).unwrap(),
            value
        );
    }
}
