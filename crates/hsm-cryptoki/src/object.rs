//! Typed object variants over templates.
//!
//! Each [`ObjectKind`] carries a static schema listing the attributes it knows and
//! which of them are mandatory. Creation templates are checked strictly; templates
//! read back from a token are accepted as they come.

use cryptoki_sys::{
    CK_OBJECT_CLASS, CKO_CERTIFICATE, CKO_DOMAIN_PARAMETERS, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY,
    CKO_SECRET_KEY,
};
use std::fmt;

use crate::{
    attribute::{AttributeKind, AttributeType as A},
    error::ValidationError,
    template::Template,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    SecretKey,
    PublicKey,
    PrivateKey,
    Certificate,
    DomainParameters,
    /// Data objects and any class code without a dedicated variant.
    Generic,
}

impl ObjectKind {
    pub fn class(self) -> Option<CK_OBJECT_CLASS> {
        match self {
            Self::SecretKey => Some(CKO_SECRET_KEY),
            Self::PublicKey => Some(CKO_PUBLIC_KEY),
            Self::PrivateKey => Some(CKO_PRIVATE_KEY),
            Self::Certificate => Some(CKO_CERTIFICATE),
            Self::DomainParameters => Some(CKO_DOMAIN_PARAMETERS),
            Self::Generic => None,
        }
    }

    /// Total: unrecognized class codes map to `Generic`.
    pub fn from_class(class: CK_OBJECT_CLASS) -> Self {
        match class {
            CKO_SECRET_KEY => Self::SecretKey,
            CKO_PUBLIC_KEY => Self::PublicKey,
            CKO_PRIVATE_KEY => Self::PrivateKey,
            CKO_CERTIFICATE => Self::Certificate,
            CKO_DOMAIN_PARAMETERS => Self::DomainParameters,
            _ => Self::Generic,
        }
    }

    pub fn schema(self) -> &'static [SchemaEntry] {
        match self {
            Self::SecretKey => SECRET_KEY,
            Self::PublicKey => PUBLIC_KEY,
            Self::PrivateKey => PRIVATE_KEY,
            Self::Certificate => CERTIFICATE,
            Self::DomainParameters => DOMAIN_PARAMETERS,
            Self::Generic => GENERIC,
        }
    }

    pub fn required(self) -> impl Iterator<Item = A> {
        self.schema()
            .iter()
            .filter(|entry| entry.required)
            .map(|entry| entry.attribute)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SecretKey => "secret key",
            Self::PublicKey => "public key",
            Self::PrivateKey => "private key",
            Self::Certificate => "certificate",
            Self::DomainParameters => "domain parameters",
            Self::Generic => "generic",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchemaEntry {
    pub attribute: A,
    pub required: bool,
}

impl SchemaEntry {
    const fn required(attribute: A) -> Self {
        Self {
            attribute,
            required: true,
        }
    }

    const fn optional(attribute: A) -> Self {
        Self {
            attribute,
            required: false,
        }
    }

    pub fn kind(&self) -> Option<AttributeKind> {
        self.attribute.kind()
    }
}

macro_rules! schema {
    (required: [$($req:ident),*], optional: [$($opt:ident),* $(,)?]) => {
        &[
            SchemaEntry::required(A::CLASS),
            $(SchemaEntry::required(A::$req),)*
            SchemaEntry::optional(A::TOKEN),
            SchemaEntry::optional(A::PRIVATE),
            SchemaEntry::optional(A::MODIFIABLE),
            SchemaEntry::optional(A::LABEL),
            SchemaEntry::optional(A::UNIQUE_ID),
            $(SchemaEntry::optional(A::$opt),)*
        ]
    };
}

static SECRET_KEY: &[SchemaEntry] = schema! {
    required: [KEY_TYPE, VALUE_LEN],
    optional: [
        ID, START_DATE, END_DATE, DERIVE, LOCAL, KEY_GEN_MECHANISM, ALLOWED_MECHANISMS,
        VALUE, SENSITIVE, ENCRYPT, DECRYPT, SIGN, VERIFY, WRAP, UNWRAP, EXTRACTABLE,
        ALWAYS_SENSITIVE, NEVER_EXTRACTABLE, CHECK_VALUE, WRAP_WITH_TRUSTED,
        WRAP_TEMPLATE, UNWRAP_TEMPLATE,
    ]
};

static PUBLIC_KEY: &[SchemaEntry] = schema! {
    required: [KEY_TYPE],
    optional: [
        ID, START_DATE, END_DATE, DERIVE, LOCAL, KEY_GEN_MECHANISM, ALLOWED_MECHANISMS,
        SUBJECT, ENCRYPT, VERIFY, VERIFY_RECOVER, WRAP, TRUSTED, WRAP_TEMPLATE, MODULUS,
        MODULUS_BITS, PUBLIC_EXPONENT, EC_PARAMS, EC_POINT,
    ]
};

static PRIVATE_KEY: &[SchemaEntry] = schema! {
    required: [KEY_TYPE],
    optional: [
        ID, START_DATE, END_DATE, DERIVE, LOCAL, KEY_GEN_MECHANISM, ALLOWED_MECHANISMS,
        SUBJECT, SENSITIVE, DECRYPT, SIGN, SIGN_RECOVER, UNWRAP, EXTRACTABLE,
        ALWAYS_SENSITIVE, NEVER_EXTRACTABLE, WRAP_WITH_TRUSTED, UNWRAP_TEMPLATE,
        ALWAYS_AUTHENTICATE, MODULUS, PUBLIC_EXPONENT, PRIVATE_EXPONENT, EC_PARAMS, VALUE,
    ]
};

static CERTIFICATE: &[SchemaEntry] = schema! {
    required: [CERTIFICATE_TYPE, VALUE],
    optional: [
        ID, SUBJECT, ISSUER, SERIAL_NUMBER, TRUSTED, CERTIFICATE_CATEGORY, CHECK_VALUE,
        START_DATE, END_DATE,
    ]
};

static DOMAIN_PARAMETERS: &[SchemaEntry] = schema! {
    required: [KEY_TYPE],
    optional: [LOCAL, PRIME, SUBPRIME, BASE, EC_PARAMS]
};

static GENERIC: &[SchemaEntry] = schema! {
    required: [],
    optional: [APPLICATION, OBJECT_ID, VALUE]
};

/// A template tagged with its object kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    kind: ObjectKind,
    template: Template,
}

impl Object {
    /// Validates `template` against the schema of `kind`.
    ///
    /// CLASS is filled in when missing. In strict mode every mandatory attribute must
    /// be present; otherwise missing ones simply read back as `Absent`.
    pub fn build(
        kind: ObjectKind,
        mut template: Template,
        strict: bool,
    ) -> Result<Self, ValidationError> {
        template.validate()?;
        if let Some(expected) = kind.class() {
            match template.get_ulong(A::CLASS) {
                None => template.set(A::CLASS, expected),
                Some(actual) if actual != expected => {
                    return Err(ValidationError::ClassMismatch {
                        expected: kind,
                        actual,
                    });
                }
                Some(_) => {}
            }
        }
        let object = Self { kind, template };
        if strict {
            if let Some(attribute) = object.missing_required().next() {
                return Err(ValidationError::MissingAttribute { kind, attribute });
            }
        }
        Ok(object)
    }

    /// Wraps a token-authored template; the kind comes from CLASS and falls back to
    /// `Generic`.
    pub fn discover(template: Template) -> Self {
        let kind = template
            .get_ulong(A::CLASS)
            .map_or(ObjectKind::Generic, ObjectKind::from_class);
        Self { kind, template }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn as_template(&self) -> &Template {
        &self.template
    }

    pub fn into_template(self) -> Template {
        self.template
    }

    /// Mandatory attributes of this kind that are currently `Absent`.
    pub fn missing_required(&self) -> impl Iterator<Item = A> + '_ {
        self.kind
            .required()
            .filter(|attribute| !self.template.contains(*attribute))
    }
}
