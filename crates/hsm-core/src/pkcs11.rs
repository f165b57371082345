//! Numeric PKCS#11 identifiers understood by the software token.
//!
//! Values mirror the `CKA_*`, `CKO_*`, `CKK_*` and `CKM_*` constants of the
//! Cryptoki headers so raw codes crossing the C boundary can be compared directly.

use crate::attributes::AttributeId;

pub mod attribute {
    use super::AttributeId;

    pub const CLASS: AttributeId = 0x0000_0000;
    pub const TOKEN: AttributeId = 0x0000_0001;
    pub const PRIVATE: AttributeId = 0x0000_0002;
    pub const LABEL: AttributeId = 0x0000_0003;
    pub const UNIQUE_ID: AttributeId = 0x0000_0004;
    pub const APPLICATION: AttributeId = 0x0000_0010;
    pub const VALUE: AttributeId = 0x0000_0011;
    pub const CERTIFICATE_TYPE: AttributeId = 0x0000_0080;
    pub const KEY_TYPE: AttributeId = 0x0000_0100;
    pub const ID: AttributeId = 0x0000_0102;
    pub const SENSITIVE: AttributeId = 0x0000_0103;
    pub const ENCRYPT: AttributeId = 0x0000_0104;
    pub const DECRYPT: AttributeId = 0x0000_0105;
    pub const WRAP: AttributeId = 0x0000_0106;
    pub const UNWRAP: AttributeId = 0x0000_0107;
    pub const SIGN: AttributeId = 0x0000_0108;
    pub const VERIFY: AttributeId = 0x0000_010A;
    pub const DERIVE: AttributeId = 0x0000_010C;
    pub const VALUE_LEN: AttributeId = 0x0000_0161;
    pub const EXTRACTABLE: AttributeId = 0x0000_0162;
    pub const LOCAL: AttributeId = 0x0000_0163;
    pub const NEVER_EXTRACTABLE: AttributeId = 0x0000_0164;
    pub const ALWAYS_SENSITIVE: AttributeId = 0x0000_0165;
    pub const KEY_GEN_MECHANISM: AttributeId = 0x0000_0166;
    pub const MODIFIABLE: AttributeId = 0x0000_0170;

    /// Attributes computed by the token; callers may not supply them.
    pub const TOKEN_MANAGED: &[AttributeId] = &[
        LOCAL,
        NEVER_EXTRACTABLE,
        ALWAYS_SENSITIVE,
        KEY_GEN_MECHANISM,
        UNIQUE_ID,
    ];
}

pub mod class {
    pub const DATA: u64 = 0x0;
    pub const CERTIFICATE: u64 = 0x1;
    pub const PUBLIC_KEY: u64 = 0x2;
    pub const PRIVATE_KEY: u64 = 0x3;
    pub const SECRET_KEY: u64 = 0x4;
}

pub mod key_type {
    pub const GENERIC_SECRET: u64 = 0x10;
    pub const AES: u64 = 0x1F;
}

pub mod mechanism {
    pub const SHA256: u64 = 0x0250;
    pub const SHA256_HMAC: u64 = 0x0251;
    pub const GENERIC_SECRET_KEY_GEN: u64 = 0x0350;
    pub const AES_KEY_GEN: u64 = 0x1080;
    pub const AES_CBC: u64 = 0x1082;
    pub const AES_CBC_PAD: u64 = 0x1085;

    /// Mechanisms the software token implements.
    pub const SUPPORTED: &[u64] = &[
        SHA256,
        SHA256_HMAC,
        GENERIC_SECRET_KEY_GEN,
        AES_KEY_GEN,
        AES_CBC,
        AES_CBC_PAD,
    ];
}
