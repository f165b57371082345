//! Mechanism identifiers, typed parameters and their native serialization.
//!
//! A [`Mechanism`] can only be built through [`Mechanism::bind`], which checks the
//! parameter shape against the table entry for the mechanism. A bound mechanism is
//! therefore always serializable into a `CK_MECHANISM`.

use cryptoki_sys::{
    CK_AES_CTR_PARAMS, CK_BYTE_PTR, CK_GCM_PARAMS, CK_MECHANISM, CK_MECHANISM_PTR,
    CK_MECHANISM_TYPE, CK_RSA_PKCS_MGF_TYPE, CK_RSA_PKCS_OAEP_PARAMS, CK_ULONG, CK_VOID_PTR,
    CKG_MGF1_SHA256, CKM_AES_CBC, CKM_AES_CBC_PAD, CKM_AES_CTR, CKM_AES_ECB, CKM_AES_GCM,
    CKM_AES_KEY_GEN, CKM_AES_KEY_WRAP, CKM_AES_KEY_WRAP_PAD, CKM_DES3_CBC, CKM_DES3_CBC_PAD,
    CKM_DES3_ECB, CKM_DES3_KEY_GEN, CKM_EC_KEY_PAIR_GEN, CKM_ECDSA, CKM_ECDSA_SHA256,
    CKM_GENERIC_SECRET_KEY_GEN, CKM_RSA_PKCS, CKM_RSA_PKCS_KEY_PAIR_GEN, CKM_RSA_PKCS_OAEP,
    CKM_SHA_1, CKM_SHA256, CKM_SHA256_HMAC, CKM_SHA256_RSA_PKCS, CKM_SHA384, CKM_SHA384_HMAC,
    CKM_SHA512, CKM_SHA512_HMAC, CKM_VENDOR_DEFINED, CKZ_DATA_SPECIFIED,
};
use std::{fmt, mem, ops::BitOr, ptr, slice};

use crate::error::ValidationError;

/// A `CK_MECHANISM_TYPE` code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MechanismType(CK_MECHANISM_TYPE);

/// Parameter shape a mechanism accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterKind {
    None,
    /// Initialization vector of exactly this many bytes.
    Iv(usize),
    AesCtr,
    Gcm,
    RsaOaep,
    /// Opaque bytes passed through unchanged.
    Raw,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("no"),
            Self::Iv(len) => write!(f, "{len}-byte IV"),
            Self::AesCtr => f.write_str("CK_AES_CTR_PARAMS"),
            Self::Gcm => f.write_str("CK_GCM_PARAMS"),
            Self::RsaOaep => f.write_str("CK_RSA_PKCS_OAEP_PARAMS"),
            Self::Raw => f.write_str("raw"),
        }
    }
}

/// Set of operations a mechanism may be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct MechanismUsage(u16);

impl MechanismUsage {
    pub const ENCRYPT: Self = Self(1 << 0);
    pub const DECRYPT: Self = Self(1 << 1);
    pub const SIGN: Self = Self(1 << 2);
    pub const VERIFY: Self = Self(1 << 3);
    pub const DIGEST: Self = Self(1 << 4);
    pub const WRAP: Self = Self(1 << 5);
    pub const UNWRAP: Self = Self(1 << 6);
    pub const GENERATE: Self = Self(1 << 7);
    pub const GENERATE_KEY_PAIR: Self = Self(1 << 8);
    pub const DERIVE: Self = Self(1 << 9);

    const CIPHER: Self = Self::ENCRYPT
        .union(Self::DECRYPT)
        .union(Self::WRAP)
        .union(Self::UNWRAP);
    const SIGNATURE: Self = Self::SIGN.union(Self::VERIFY);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            Self::ENCRYPT => "encrypt",
            Self::DECRYPT => "decrypt",
            Self::SIGN => "sign",
            Self::VERIFY => "verify",
            Self::DIGEST => "digest",
            Self::WRAP => "wrap keys",
            Self::UNWRAP => "unwrap keys",
            Self::GENERATE => "generate keys",
            Self::GENERATE_KEY_PAIR => "generate key pairs",
            Self::DERIVE => "derive keys",
            _ => "perform this operation",
        }
    }
}

impl BitOr for MechanismUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

struct MechanismInfo {
    code: CK_MECHANISM_TYPE,
    name: &'static str,
    parameter: ParameterKind,
    usage: MechanismUsage,
}

macro_rules! mechanism_table {
    ($($name:ident = $code:ident : $param:expr, $usage:expr;)*) => {
        impl MechanismType {
            $(pub const $name: Self = Self($code);)*
        }

        static MECHANISMS: &[MechanismInfo] = &[
            $(MechanismInfo {
                code: $code,
                name: stringify!($code),
                parameter: $param,
                usage: $usage,
            }),*
        ];
    };
}

use MechanismUsage as U;
use ParameterKind as P;

mechanism_table! {
    AES_KEY_GEN = CKM_AES_KEY_GEN: P::None, U::GENERATE;
    AES_ECB = CKM_AES_ECB: P::None, U::CIPHER;
    AES_CBC = CKM_AES_CBC: P::Iv(16), U::CIPHER;
    AES_CBC_PAD = CKM_AES_CBC_PAD: P::Iv(16), U::CIPHER;
    AES_CTR = CKM_AES_CTR: P::AesCtr, U::CIPHER;
    AES_GCM = CKM_AES_GCM: P::Gcm, U::CIPHER;
    AES_KEY_WRAP = CKM_AES_KEY_WRAP: P::Raw, U::CIPHER;
    AES_KEY_WRAP_PAD = CKM_AES_KEY_WRAP_PAD: P::Raw, U::CIPHER;
    DES3_KEY_GEN = CKM_DES3_KEY_GEN: P::None, U::GENERATE;
    DES3_ECB = CKM_DES3_ECB: P::None, U::CIPHER;
    DES3_CBC = CKM_DES3_CBC: P::Iv(8), U::CIPHER;
    DES3_CBC_PAD = CKM_DES3_CBC_PAD: P::Iv(8), U::CIPHER;
    GENERIC_SECRET_KEY_GEN = CKM_GENERIC_SECRET_KEY_GEN: P::None, U::GENERATE;
    SHA_1 = CKM_SHA_1: P::None, U::DIGEST;
    SHA256 = CKM_SHA256: P::None, U::DIGEST;
    SHA384 = CKM_SHA384: P::None, U::DIGEST;
    SHA512 = CKM_SHA512: P::None, U::DIGEST;
    SHA256_HMAC = CKM_SHA256_HMAC: P::None, U::SIGNATURE;
    SHA384_HMAC = CKM_SHA384_HMAC: P::None, U::SIGNATURE;
    SHA512_HMAC = CKM_SHA512_HMAC: P::None, U::SIGNATURE;
    RSA_PKCS_KEY_PAIR_GEN = CKM_RSA_PKCS_KEY_PAIR_GEN: P::None, U::GENERATE_KEY_PAIR;
    RSA_PKCS = CKM_RSA_PKCS: P::None, U::CIPHER.union(U::SIGNATURE);
    RSA_PKCS_OAEP = CKM_RSA_PKCS_OAEP: P::RsaOaep, U::CIPHER;
    SHA256_RSA_PKCS = CKM_SHA256_RSA_PKCS: P::None, U::SIGNATURE;
    EC_KEY_PAIR_GEN = CKM_EC_KEY_PAIR_GEN: P::None, U::GENERATE_KEY_PAIR;
    ECDSA = CKM_ECDSA: P::None, U::SIGNATURE;
    ECDSA_SHA256 = CKM_ECDSA_SHA256: P::None, U::SIGNATURE;
}

impl MechanismType {
    pub const fn new(code: CK_MECHANISM_TYPE) -> Self {
        Self(code)
    }

    pub const fn raw(self) -> CK_MECHANISM_TYPE {
        self.0
    }

    fn info(self) -> Option<&'static MechanismInfo> {
        MECHANISMS.iter().find(|info| info.code == self.0)
    }

    pub fn name(self) -> Option<&'static str> {
        self.info().map(|info| info.name)
    }

    /// Parameter shape for known mechanisms.
    pub fn parameter_kind(self) -> Option<ParameterKind> {
        self.info().map(|info| info.parameter)
    }

    pub fn usage(self) -> Option<MechanismUsage> {
        self.info().map(|info| info.usage)
    }

    pub fn is_vendor_defined(self) -> bool {
        self.0 & CKM_VENDOR_DEFINED != 0 && self.info().is_none()
    }
}

impl From<CK_MECHANISM_TYPE> for MechanismType {
    fn from(code: CK_MECHANISM_TYPE) -> Self {
        Self(code)
    }
}

impl fmt::Display for MechanismType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "CKM_{:#x}", self.0),
        }
    }
}

impl fmt::Debug for MechanismType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Typed mechanism parameter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MechanismParams {
    #[default]
    None,
    Iv(Vec<u8>),
    AesCtr {
        counter_bits: CK_ULONG,
        counter_block: [u8; 16],
    },
    Gcm {
        iv: Vec<u8>,
        aad: Vec<u8>,
        tag_bits: CK_ULONG,
    },
    RsaOaep {
        hash: MechanismType,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        /// Encoding parameter label, if any.
        source: Option<Vec<u8>>,
    },
    Raw(Vec<u8>),
}

impl MechanismParams {
    /// OAEP over SHA-256 with MGF1-SHA256 and no label.
    pub fn oaep_sha256() -> Self {
        Self::RsaOaep {
            hash: MechanismType::SHA256,
            mgf: CKG_MGF1_SHA256,
            source: None,
        }
    }
}

/// A mechanism bound to parameters that match its shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mechanism {
    ty: MechanismType,
    params: MechanismParams,
}

impl Mechanism {
    pub fn bind(ty: MechanismType, params: MechanismParams) -> Result<Self, ValidationError> {
        let mismatch = |expected| ValidationError::ParameterMismatch {
            mechanism: ty,
            expected,
        };
        let malformed = |reason| ValidationError::MalformedParameter {
            mechanism: ty,
            reason,
        };

        match (ty.parameter_kind(), &params) {
            // Unknown mechanisms are passed through untouched.
            (None, MechanismParams::None | MechanismParams::Raw(_)) => {}
            (None, _) => return Err(mismatch(ParameterKind::Raw)),
            (Some(ParameterKind::None), MechanismParams::None) => {}
            (Some(ParameterKind::Iv(expected)), MechanismParams::Iv(iv)) => {
                if iv.len() != expected {
                    return Err(ValidationError::IvLength {
                        mechanism: ty,
                        expected,
                        actual: iv.len(),
                    });
                }
            }
            (Some(ParameterKind::AesCtr), MechanismParams::AesCtr { counter_bits, .. }) => {
                if !(1..=128).contains(counter_bits) {
                    return Err(malformed("counter bits must be between 1 and 128"));
                }
            }
            (Some(ParameterKind::Gcm), MechanismParams::Gcm { iv, tag_bits, .. }) => {
                if iv.is_empty() {
                    return Err(malformed("GCM needs a non-empty IV"));
                }
                if *tag_bits > 128 || tag_bits % 8 != 0 {
                    return Err(malformed("tag length must be a whole number of bytes up to 128 bits"));
                }
            }
            (Some(ParameterKind::RsaOaep), MechanismParams::RsaOaep { hash, .. }) => {
                if hash.usage().is_some_and(|usage| !usage.contains(MechanismUsage::DIGEST)) {
                    return Err(malformed("OAEP hash must be a digest mechanism"));
                }
            }
            (Some(ParameterKind::Raw), MechanismParams::None | MechanismParams::Raw(_)) => {}
            (Some(expected), _) => return Err(mismatch(expected)),
        }
        Ok(Self { ty, params })
    }

    /// Mechanism without parameters.
    pub fn new(ty: MechanismType) -> Result<Self, ValidationError> {
        Self::bind(ty, MechanismParams::None)
    }

    pub fn with_iv(ty: MechanismType, iv: impl Into<Vec<u8>>) -> Result<Self, ValidationError> {
        Self::bind(ty, MechanismParams::Iv(iv.into()))
    }

    pub fn mechanism_type(&self) -> MechanismType {
        self.ty
    }

    pub fn params(&self) -> &MechanismParams {
        &self.params
    }

    pub fn usage(&self) -> Option<MechanismUsage> {
        self.ty.usage()
    }

    /// Unknown mechanisms are assumed to permit anything; the token decides.
    pub fn permits(&self, usage: MechanismUsage) -> bool {
        self.usage().is_none_or(|known| known.contains(usage))
    }

    pub(crate) fn require(&self, usage: MechanismUsage) -> Result<(), ValidationError> {
        if self.permits(usage) {
            Ok(())
        } else {
            Err(ValidationError::MechanismNotPermitted {
                mechanism: self.ty,
                usage: usage.describe(),
            })
        }
    }

    /// Native form. The returned value owns every buffer the record points to.
    pub fn serialize(&self) -> RawMechanism {
        let mut raw = RawMechanism {
            record: CK_MECHANISM {
                mechanism: self.ty.raw(),
                pParameter: ptr::null_mut(),
                ulParameterLen: 0,
            },
            parameter: RawParameter::None,
        };
        raw.parameter = match &self.params {
            MechanismParams::None => RawParameter::None,
            MechanismParams::Iv(bytes) | MechanismParams::Raw(bytes) => {
                RawParameter::Bytes(bytes.clone())
            }
            MechanismParams::AesCtr {
                counter_bits,
                counter_block,
            } => RawParameter::AesCtr(Box::new(CK_AES_CTR_PARAMS {
                ulCounterBits: *counter_bits,
                cb: *counter_block,
            })),
            MechanismParams::Gcm { iv, aad, tag_bits } => {
                let mut iv = iv.clone();
                let mut aad = aad.clone();
                let params = Box::new(CK_GCM_PARAMS {
                    pIv: iv.as_mut_ptr() as CK_BYTE_PTR,
                    ulIvLen: iv.len() as CK_ULONG,
                    ulIvBits: (iv.len() * 8) as CK_ULONG,
                    pAAD: if aad.is_empty() {
                        ptr::null_mut()
                    } else {
                        aad.as_mut_ptr() as CK_BYTE_PTR
                    },
                    ulAADLen: aad.len() as CK_ULONG,
                    ulTagBits: *tag_bits,
                });
                RawParameter::Gcm { params, iv, aad }
            }
            MechanismParams::RsaOaep { hash, mgf, source } => {
                let mut label = source.clone().unwrap_or_default();
                let params = Box::new(CK_RSA_PKCS_OAEP_PARAMS {
                    hashAlg: hash.raw(),
                    mgf: *mgf,
                    source: if source.is_some() { CKZ_DATA_SPECIFIED } else { 0 },
                    pSourceData: if label.is_empty() {
                        ptr::null_mut()
                    } else {
                        label.as_mut_ptr() as CK_VOID_PTR
                    },
                    ulSourceDataLen: label.len() as CK_ULONG,
                });
                RawParameter::RsaOaep { params, label }
            }
        };
        let (pointer, len) = raw.parameter.pointer();
        raw.record.pParameter = pointer;
        raw.record.ulParameterLen = len;
        raw
    }
}

enum RawParameter {
    None,
    Bytes(Vec<u8>),
    AesCtr(Box<CK_AES_CTR_PARAMS>),
    Gcm {
        params: Box<CK_GCM_PARAMS>,
        #[allow(dead_code)]
        iv: Vec<u8>,
        #[allow(dead_code)]
        aad: Vec<u8>,
    },
    RsaOaep {
        params: Box<CK_RSA_PKCS_OAEP_PARAMS>,
        #[allow(dead_code)]
        label: Vec<u8>,
    },
}

impl RawParameter {
    fn pointer(&mut self) -> (CK_VOID_PTR, CK_ULONG) {
        fn boxed<T>(value: &mut Box<T>) -> (CK_VOID_PTR, CK_ULONG) {
            (
                value.as_mut() as *mut T as CK_VOID_PTR,
                mem::size_of::<T>() as CK_ULONG,
            )
        }
        match self {
            Self::None => (ptr::null_mut(), 0),
            Self::Bytes(bytes) if bytes.is_empty() => (ptr::null_mut(), 0),
            Self::Bytes(bytes) => (bytes.as_mut_ptr() as CK_VOID_PTR, bytes.len() as CK_ULONG),
            Self::AesCtr(params) => boxed(params),
            Self::Gcm { params, .. } => boxed(params),
            Self::RsaOaep { params, .. } => boxed(params),
        }
    }
}

/// `CK_MECHANISM` plus the parameter storage it points into.
pub struct RawMechanism {
    record: CK_MECHANISM,
    parameter: RawParameter,
}

impl RawMechanism {
    pub fn as_mut_ptr(&mut self) -> CK_MECHANISM_PTR {
        &mut self.record
    }

    pub fn mechanism_type(&self) -> MechanismType {
        MechanismType::new(self.record.mechanism)
    }

    /// Bytes the parameter pointer covers.
    pub fn parameter_bytes(&self) -> &[u8] {
        let len = self.record.ulParameterLen as usize;
        if self.record.pParameter.is_null() || len == 0 {
            return &[];
        }
        // SAFETY: pParameter points into storage owned by `self.parameter`.
        unsafe { slice::from_raw_parts(self.record.pParameter as *const u8, len) }
    }
}

impl fmt::Debug for RawMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMechanism")
            .field("mechanism", &self.mechanism_type())
            .field("parameter_len", &self.record.ulParameterLen)
            .finish()
    }
}

// SAFETY: the raw pointers only reference heap storage owned by the value itself.
unsafe impl Send for RawMechanism {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_requires_a_sixteen_byte_iv() {
        assert!(Mechanism::with_iv(MechanismType::AES_CBC_PAD, vec![0u8; 16]).is_ok());
        assert_eq!(
            Mechanism::with_iv(MechanismType::AES_CBC_PAD, vec![0u8; 8]).unwrap_err(),
            ValidationError::IvLength {
                mechanism: MechanismType::AES_CBC_PAD,
                expected: 16,
                actual: 8,
            }
        );
        assert!(matches!(
            Mechanism::new(MechanismType::AES_CBC),
            Err(ValidationError::ParameterMismatch { .. })
        ));
    }

    #[test]
    fn parameterless_mechanisms_reject_parameters() {
        assert!(Mechanism::new(MechanismType::SHA256).is_ok());
        assert!(matches!(
            Mechanism::with_iv(MechanismType::SHA256, vec![1, 2]),
            Err(ValidationError::ParameterMismatch {
                expected: ParameterKind::None,
                ..
            })
        ));
    }

    #[test]
    fn gcm_and_ctr_parameters_are_checked() {
        let gcm = |tag_bits| {
            Mechanism::bind(
                MechanismType::AES_GCM,
                MechanismParams::Gcm {
                    iv: vec![0; 12],
                    aad: Vec::new(),
                    tag_bits,
                },
            )
        };
        assert!(gcm(128).is_ok());
        assert!(matches!(gcm(130), Err(ValidationError::MalformedParameter { .. })));

        let ctr = Mechanism::bind(
            MechanismType::AES_CTR,
            MechanismParams::AesCtr {
                counter_bits: 0,
                counter_block: [0; 16],
            },
        );
        assert!(matches!(ctr, Err(ValidationError::MalformedParameter { .. })));
    }

    #[test]
    fn serialized_iv_is_pointed_to() {
        let iv: Vec<u8> = (0u8..16).collect();
        let mechanism = Mechanism::with_iv(MechanismType::AES_CBC_PAD, iv.clone()).unwrap();
        let raw = mechanism.serialize();
        assert_eq!(raw.mechanism_type(), MechanismType::AES_CBC_PAD);
        assert_eq!(raw.parameter_bytes(), iv.as_slice());
    }

    #[test]
    fn serialized_gcm_points_at_owned_buffers() {
        let mechanism = Mechanism::bind(
            MechanismType::AES_GCM,
            MechanismParams::Gcm {
                iv: vec![7; 12],
                aad: b"header".to_vec(),
                tag_bits: 96,
            },
        )
        .unwrap();
        let mut raw = mechanism.serialize();
        assert_eq!(raw.parameter_bytes().len(), mem::size_of::<CK_GCM_PARAMS>());
        let record = unsafe { &*raw.as_mut_ptr() };
        let params = unsafe { &*(record.pParameter as *const CK_GCM_PARAMS) };
        let iv = unsafe { slice::from_raw_parts(params.pIv, params.ulIvLen as usize) };
        let aad = unsafe { slice::from_raw_parts(params.pAAD, params.ulAADLen as usize) };
        assert_eq!(iv, [7u8; 12].as_slice());
        assert_eq!(aad, b"header".as_slice());
        assert_eq!(params.ulIvBits, 96);
        assert_eq!(params.ulTagBits, 96);
    }

    #[test]
    fn usage_flags_gate_operations() {
        let hmac = Mechanism::new(MechanismType::SHA256_HMAC).unwrap();
        assert!(hmac.permits(MechanismUsage::SIGN));
        assert!(!hmac.permits(MechanismUsage::ENCRYPT));
        assert!(hmac.require(MechanismUsage::ENCRYPT).is_err());

        let vendor = Mechanism::bind(
            MechanismType::new(CKM_VENDOR_DEFINED | 1),
            MechanismParams::Raw(vec![1]),
        )
        .unwrap();
        assert!(vendor.permits(MechanismUsage::ENCRYPT));
        assert!(vendor.mechanism_type().is_vendor_defined());
    }
}
