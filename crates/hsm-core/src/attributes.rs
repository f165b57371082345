use crate::error::HsmError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier for a PKCS#11-style attribute (mirrors CK_ATTRIBUTE_TYPE numeric values).
pub type AttributeId = u64;

/// Supported attribute value representations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(tag = "type", content = "value")]
pub enum AttributeValue {
    Bool(bool),
    Uint(u64),
    Bytes(Vec<u8>),
    Mechanisms(Vec<u64>),
}

/// Template used when searching for objects via attribute matching.
#[derive(Clone, Debug, Default)]
pub struct AttributeTemplate {
    entries: Vec<(AttributeId, AttributeValue)>,
}

impl AttributeTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: AttributeId, value: AttributeValue) {
        self.entries.push((id, value));
    }

    pub fn entries(&self) -> &[(AttributeId, AttributeValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(AttributeId, AttributeValue)> for AttributeTemplate {
    fn from_iter<I: IntoIterator<Item = (AttributeId, AttributeValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Attributes stored with a token object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSet {
    #[serde(default)]
    entries: HashMap<AttributeId, AttributeValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: AttributeId, value: AttributeValue) -> Option<AttributeValue> {
        self.entries.insert(id, value)
    }

    /// Inserts `value` only when the attribute has not been supplied.
    pub fn insert_default(&mut self, id: AttributeId, value: AttributeValue) {
        self.entries.entry(id).or_insert(value);
    }

    pub fn get(&self, id: AttributeId) -> Option<&AttributeValue> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: AttributeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&mut self, id: AttributeId) -> Option<AttributeValue> {
        self.entries.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeId, &AttributeValue)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Boolean attribute lookup; a missing attribute reads as `false`.
    pub fn flag(&self, id: AttributeId) -> Result<bool, HsmError> {
        match self.entries.get(&id) {
            None => Ok(false),
            Some(AttributeValue::Bool(value)) => Ok(*value),
            Some(_) => Err(HsmError::AttributeValueInvalid(id)),
        }
    }

    pub fn uint(&self, id: AttributeId) -> Result<Option<u64>, HsmError> {
        match self.entries.get(&id) {
            None => Ok(None),
            Some(AttributeValue::Uint(value)) => Ok(Some(*value)),
            Some(_) => Err(HsmError::AttributeValueInvalid(id)),
        }
    }

    pub fn bytes(&self, id: AttributeId) -> Result<Option<&[u8]>, HsmError> {
        match self.entries.get(&id) {
            None => Ok(None),
            Some(AttributeValue::Bytes(value)) => Ok(Some(value)),
            Some(_) => Err(HsmError::AttributeValueInvalid(id)),
        }
    }

    /// Ensure all required attribute identifiers are present.
    pub fn validate_required(&self, required: &[AttributeId]) -> Result<(), HsmError> {
        match required.iter().find(|id| !self.entries.contains_key(id)) {
            Some(id) => Err(HsmError::TemplateIncomplete(*id)),
            None => Ok(()),
        }
    }

    /// Reject attributes the caller is not allowed to supply.
    pub fn ensure_absent(&self, forbidden: &[AttributeId]) -> Result<(), HsmError> {
        match forbidden.iter().find(|id| self.entries.contains_key(id)) {
            Some(id) => Err(HsmError::AttributeReadOnly(*id)),
            None => Ok(()),
        }
    }

    /// Returns true when all entries in the template match the set exactly.
    pub fn matches_template(&self, template: &AttributeTemplate) -> bool {
        template
            .entries()
            .iter()
            .all(|(id, value)| self.get(*id) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkcs11::attribute::{CLASS, ENCRYPT, LABEL, VALUE_LEN};

    #[test]
    fn template_match_requires_every_entry() {
        let mut set = AttributeSet::new();
        set.insert(CLASS, AttributeValue::Uint(4));
        set.insert(LABEL, AttributeValue::Bytes(b"x".to_vec()));

        let both: AttributeTemplate = [
            (CLASS, AttributeValue::Uint(4)),
            (LABEL, AttributeValue::Bytes(b"x".to_vec())),
        ]
        .into_iter()
        .collect();
        assert!(set.matches_template(&both));

        let wrong_label: AttributeTemplate = [
            (CLASS, AttributeValue::Uint(4)),
            (LABEL, AttributeValue::Bytes(b"y".to_vec())),
        ]
        .into_iter()
        .collect();
        assert!(!set.matches_template(&wrong_label));
        assert!(set.matches_template(&AttributeTemplate::new()));
    }

    #[test]
    fn typed_lookups_reject_wrong_representation() {
        let mut set = AttributeSet::new();
        set.insert(ENCRYPT, AttributeValue::Uint(1));
        set.insert(VALUE_LEN, AttributeValue::Uint(16));

        assert_eq!(set.flag(ENCRYPT), Err(HsmError::AttributeValueInvalid(ENCRYPT)));
        assert_eq!(set.uint(VALUE_LEN), Ok(Some(16)));
        assert_eq!(set.flag(LABEL), Ok(false));
    }

    #[test]
    fn required_and_forbidden_checks() {
        let mut set = AttributeSet::new();
        set.insert(CLASS, AttributeValue::Uint(4));
        assert_eq!(
            set.validate_required(&[CLASS, VALUE_LEN]),
            Err(HsmError::TemplateIncomplete(VALUE_LEN))
        );
        assert!(set.ensure_absent(&[VALUE_LEN]).is_ok());
        assert_eq!(
            set.ensure_absent(&[CLASS]),
            Err(HsmError::AttributeReadOnly(CLASS))
        );
    }
}
