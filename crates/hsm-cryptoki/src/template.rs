//! Attribute templates and their flat `CK_ATTRIBUTE` representation.

use cryptoki_sys::{CK_ATTRIBUTE, CK_ATTRIBUTE_PTR, CK_ULONG, CK_UNAVAILABLE_INFORMATION, CK_VOID_PTR};
use indexmap::IndexMap;
use std::{mem, ptr, slice};

use crate::{
    attribute::{AttributeKind, AttributeType, AttributeValue},
    error::ValidationError,
};

static ABSENT: AttributeValue = AttributeValue::Absent;

/// Ordered collection of typed attributes with unique types.
///
/// Setting a type that is already present replaces its value in place, so the
/// original insertion order is kept. Equality compares entries in order.
#[derive(Clone, Debug, Default)]
pub struct Template {
    entries: IndexMap<AttributeType, AttributeValue>,
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.entries.iter().eq(other.entries.iter())
    }
}

impl Eq for Template {}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Template::set`].
    pub fn with(mut self, ty: AttributeType, value: impl Into<AttributeValue>) -> Self {
        self.set(ty, value);
        self
    }

    pub fn set(&mut self, ty: AttributeType, value: impl Into<AttributeValue>) {
        self.entries.insert(ty, value.into());
    }

    /// Never fails: a missing type reads as [`AttributeValue::Absent`].
    pub fn get(&self, ty: AttributeType) -> &AttributeValue {
        self.entries.get(&ty).unwrap_or(&ABSENT)
    }

    pub fn get_bool(&self, ty: AttributeType) -> Option<bool> {
        self.get(ty).as_bool()
    }

    pub fn get_ulong(&self, ty: AttributeType) -> Option<CK_ULONG> {
        self.get(ty).as_ulong()
    }

    pub fn get_bytes(&self, ty: AttributeType) -> Option<&[u8]> {
        self.get(ty).as_bytes()
    }

    /// True when the type has a value other than `Absent`.
    pub fn contains(&self, ty: AttributeType) -> bool {
        !self.get(ty).is_absent()
    }

    pub fn remove(&mut self, ty: AttributeType) -> Option<AttributeValue> {
        self.entries.shift_remove(&ty)
    }

    /// Copies every entry of `other` into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: &Template) {
        for (ty, value) in &other.entries {
            self.set(*ty, value.clone());
        }
    }

    pub fn merged(mut self, other: &Template) -> Self {
        self.merge(other);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttributeType, &AttributeValue)> {
        self.entries.iter().map(entry)
    }

    pub fn types(&self) -> impl Iterator<Item = AttributeType> + '_ {
        self.entries.keys().copied()
    }

    /// Checks every present value against the kind registered for its type.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (ty, value) in &self.entries {
            match value {
                AttributeValue::Attributes(nested) => nested.validate()?,
                AttributeValue::Date(Some(date)) if !(0..=9999).contains(&date.year()) => {
                    return Err(ValidationError::MalformedValue {
                        attribute: *ty,
                        reason: "date year does not fit in four digits",
                    });
                }
                _ => {}
            }
            let (Some(expected), Some(actual)) = (ty.kind(), value.kind()) else {
                continue;
            };
            if expected != actual {
                return Err(ValidationError::KindMismatch {
                    attribute: *ty,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Owned native copy of this template. `Absent` entries are left out.
    pub fn to_flat_array(&self) -> Result<FlatTemplate, ValidationError> {
        self.validate()?;
        let mut flat = FlatTemplate::default();
        for (ty, value) in &self.entries {
            match value {
                AttributeValue::Absent => {}
                AttributeValue::Attributes(inner) => {
                    let mut nested = inner.to_flat_array()?;
                    let len = nested.records.len() * mem::size_of::<CK_ATTRIBUTE>();
                    flat.records.push(CK_ATTRIBUTE {
                        type_: ty.raw(),
                        pValue: nested.records.as_mut_ptr() as CK_VOID_PTR,
                        ulValueLen: len as CK_ULONG,
                    });
                    flat.nested.push(nested);
                }
                scalar => {
                    let mut bytes = scalar.encode();
                    flat.records.push(CK_ATTRIBUTE {
                        type_: ty.raw(),
                        pValue: bytes.as_mut_ptr() as CK_VOID_PTR,
                        ulValueLen: bytes.len() as CK_ULONG,
                    });
                    flat.values.push(bytes);
                }
            }
        }
        Ok(flat)
    }

    /// Rebuilds a template from native records.
    ///
    /// Records carrying `CK_UNAVAILABLE_INFORMATION` become `Absent`; unknown type
    /// codes are kept as raw bytes.
    ///
    /// # Safety
    ///
    /// Every record with a non-null `pValue` must point to `ulValueLen` readable
    /// bytes, and attribute-array records must point to properly aligned nested
    /// `CK_ATTRIBUTE` arrays satisfying the same contract.
    pub unsafe fn from_flat_array(records: &[CK_ATTRIBUTE]) -> Result<Self, ValidationError> {
        let mut template = Self::new();
        for record in records {
            let ty = AttributeType::from(record.type_);
            let value = if record.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                AttributeValue::Absent
            } else {
                let len = record.ulValueLen as usize;
                if record.pValue.is_null() {
                    if len != 0 {
                        return Err(ValidationError::MalformedValue {
                            attribute: ty,
                            reason: "length reported without a value buffer",
                        });
                    }
                    if ty.kind() == Some(AttributeKind::AttributeArray) {
                        AttributeValue::Attributes(Self::new())
                    } else {
                        AttributeValue::decode(ty, &[])?
                    }
                } else if ty.kind() == Some(AttributeKind::AttributeArray) {
                    let width = mem::size_of::<CK_ATTRIBUTE>();
                    if len % width != 0 {
                        return Err(ValidationError::MalformedValue {
                            attribute: ty,
                            reason: "attribute array is not a whole number of records",
                        });
                    }
                    // SAFETY: caller guarantees pValue points to len / width records.
                    let nested = unsafe {
                        slice::from_raw_parts(record.pValue as *const CK_ATTRIBUTE, len / width)
                    };
                    AttributeValue::Attributes(unsafe { Self::from_flat_array(nested) }?)
                } else {
                    // SAFETY: caller guarantees pValue points to len readable bytes.
                    let bytes = unsafe { slice::from_raw_parts(record.pValue as *const u8, len) };
                    AttributeValue::decode(ty, bytes)?
                }
            };
            template.set(ty, value);
        }
        Ok(template)
    }
}

impl FromIterator<(AttributeType, AttributeValue)> for Template {
    fn from_iter<I: IntoIterator<Item = (AttributeType, AttributeValue)>>(iter: I) -> Self {
        let mut template = Self::new();
        for (ty, value) in iter {
            template.set(ty, value);
        }
        template
    }
}

fn entry<'a>(
    (ty, value): (&'a AttributeType, &'a AttributeValue),
) -> (AttributeType, &'a AttributeValue) {
    (*ty, value)
}

impl<'a> IntoIterator for &'a Template {
    type Item = (AttributeType, &'a AttributeValue);
    type IntoIter = std::iter::Map<
        indexmap::map::Iter<'a, AttributeType, AttributeValue>,
        fn((&'a AttributeType, &'a AttributeValue)) -> (AttributeType, &'a AttributeValue),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(entry as fn(_) -> _)
    }
}

/// Native `CK_ATTRIBUTE` array together with the buffers its records point into.
///
/// Records stay valid for as long as the `FlatTemplate` is alive; moving it does
/// not move the heap buffers.
#[derive(Debug, Default)]
pub struct FlatTemplate {
    records: Vec<CK_ATTRIBUTE>,
    values: Vec<Vec<u8>>,
    nested: Vec<FlatTemplate>,
}

impl FlatTemplate {
    pub fn records(&self) -> &[CK_ATTRIBUTE] {
        &self.records
    }

    pub fn as_mut_ptr(&mut self) -> CK_ATTRIBUTE_PTR {
        if self.records.is_empty() {
            ptr::null_mut()
        } else {
            self.records.as_mut_ptr()
        }
    }

    pub fn count(&self) -> CK_ULONG {
        self.records.len() as CK_ULONG
    }

    pub fn to_template(&self) -> Result<Template, ValidationError> {
        // SAFETY: every record points into buffers owned by self.
        unsafe { Template::from_flat_array(&self.records) }
    }
}

/// Buffers for one `C_GetAttributeValue` exchange.
///
/// The read protocol always takes two calls: [`AttributeQuery::lengths`] asks for
/// the size of each value, then [`AttributeQuery::values`] hands the token buffers
/// of exactly those sizes.
#[derive(Debug)]
pub struct AttributeQuery {
    records: Vec<CK_ATTRIBUTE>,
    buffers: Vec<Vec<u8>>,
}

impl AttributeQuery {
    /// First pass: null value pointers carrying the unavailable length marker.
    pub fn lengths(types: &[AttributeType]) -> Self {
        let records = types
            .iter()
            .map(|ty| CK_ATTRIBUTE {
                type_: ty.raw(),
                pValue: ptr::null_mut(),
                ulValueLen: CK_UNAVAILABLE_INFORMATION,
            })
            .collect();
        Self {
            records,
            buffers: Vec::new(),
        }
    }

    /// Second pass: one zeroed buffer of the given size per requested type.
    pub fn values(requests: &[(AttributeType, usize)]) -> Self {
        let mut buffers: Vec<Vec<u8>> = requests.iter().map(|(_, len)| vec![0u8; *len]).collect();
        let records = requests
            .iter()
            .zip(buffers.iter_mut())
            .map(|((ty, len), buffer)| CK_ATTRIBUTE {
                type_: ty.raw(),
                pValue: buffer.as_mut_ptr() as CK_VOID_PTR,
                ulValueLen: *len as CK_ULONG,
            })
            .collect();
        Self { records, buffers }
    }

    pub fn as_mut_ptr(&mut self) -> CK_ATTRIBUTE_PTR {
        self.records.as_mut_ptr()
    }

    pub fn count(&self) -> CK_ULONG {
        self.records.len() as CK_ULONG
    }

    /// Lengths reported by the token after the first pass; `None` where the token
    /// answered with the unavailable marker.
    pub fn reported(&self) -> Vec<(AttributeType, Option<CK_ULONG>)> {
        self.records
            .iter()
            .map(|record| {
                let len = (record.ulValueLen != CK_UNAVAILABLE_INFORMATION).then_some(record.ulValueLen);
                (AttributeType::from(record.type_), len)
            })
            .collect()
    }

    /// First sized record the token left unfilled after the second pass.
    pub fn unfilled(&self) -> Option<AttributeType> {
        self.records
            .iter()
            .zip(&self.buffers)
            .find(|(record, buffer)| {
                !buffer.is_empty() && record.ulValueLen == CK_UNAVAILABLE_INFORMATION
            })
            .map(|(record, _)| AttributeType::from(record.type_))
    }

    /// Decodes the second-pass buffers. Values the token marked unavailable become
    /// `Absent`.
    pub fn into_template(self) -> Result<Template, ValidationError> {
        let mut template = Template::new();
        for (record, buffer) in self.records.iter().zip(&self.buffers) {
            let ty = AttributeType::from(record.type_);
            if record.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                template.set(ty, AttributeValue::Absent);
                continue;
            }
            let bytes = buffer
                .get(..record.ulValueLen as usize)
                .ok_or(ValidationError::MalformedValue {
                    attribute: ty,
                    reason: "token reported more bytes than the buffer holds",
                })?;
            template.set(ty, AttributeValue::decode(ty, bytes)?);
        }
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::MechanismType;
    use time::macros::date;

    fn sample() -> Template {
        Template::new()
            .with(AttributeType::CLASS, 4 as CK_ULONG)
            .with(AttributeType::LABEL, "x")
            .with(AttributeType::ENCRYPT, true)
            .with(AttributeType::START_DATE, date!(2024 - 01 - 15))
            .with(
                AttributeType::ALLOWED_MECHANISMS,
                vec![MechanismType::AES_CBC_PAD],
            )
    }

    #[test]
    fn set_overwrites_in_place() {
        let mut template = sample();
        template.set(AttributeType::CLASS, 3 as CK_ULONG);
        assert_eq!(template.len(), 5);
        assert_eq!(template.types().next(), Some(AttributeType::CLASS));
        assert_eq!(template.get_ulong(AttributeType::CLASS), Some(3));
    }

    #[test]
    fn remove_keeps_the_remaining_order() {
        let mut template = sample();
        assert_eq!(template.remove(AttributeType::LABEL), Some(AttributeValue::from("x")));
        assert_eq!(template.remove(AttributeType::LABEL), None);
        assert_eq!(
            template.types().collect::<Vec<_>>(),
            vec![
                AttributeType::CLASS,
                AttributeType::ENCRYPT,
                AttributeType::START_DATE,
                AttributeType::ALLOWED_MECHANISMS,
            ]
        );
    }

    #[test]
    fn equality_follows_insertion_order() {
        let forward = Template::new()
            .with(AttributeType::ENCRYPT, true)
            .with(AttributeType::DECRYPT, true);
        let reversed = Template::new()
            .with(AttributeType::DECRYPT, true)
            .with(AttributeType::ENCRYPT, true);
        assert_ne!(forward, reversed);
        assert_eq!(forward, forward.clone());
    }

    #[test]
    fn dates_outside_four_digit_years_are_rejected() {
        for year in [-1, -2024] {
            let date = time::Date::from_calendar_date(year, time::Month::June, 1).unwrap();
            let template = Template::new().with(AttributeType::END_DATE, date);
            assert_eq!(
                template.to_flat_array().unwrap_err(),
                ValidationError::MalformedValue {
                    attribute: AttributeType::END_DATE,
                    reason: "date year does not fit in four digits",
                }
            );
        }
        let edge = Template::new().with(AttributeType::END_DATE, date!(9999 - 12 - 31));
        assert_eq!(edge.to_flat_array().unwrap().to_template().unwrap(), edge);
    }

    #[test]
    fn missing_types_read_as_absent() {
        let template = sample();
        assert!(template.get(AttributeType::VALUE).is_absent());
        assert!(!template.contains(AttributeType::VALUE));
        assert_eq!(template.get_bytes(AttributeType::LABEL), Some(b"x".as_slice()));
    }

    #[test]
    fn merge_is_last_write_wins() {
        let base = Template::new()
            .with(AttributeType::ENCRYPT, true)
            .with(AttributeType::LABEL, "base");
        let overlay = Template::new()
            .with(AttributeType::LABEL, "overlay")
            .with(AttributeType::DECRYPT, true);
        let merged = base.merged(&overlay);
        assert_eq!(merged.get_bytes(AttributeType::LABEL), Some(b"overlay".as_slice()));
        assert_eq!(
            merged.types().collect::<Vec<_>>(),
            vec![AttributeType::ENCRYPT, AttributeType::LABEL, AttributeType::DECRYPT]
        );
    }

    #[test]
    fn flat_array_roundtrip_preserves_order_and_values() {
        let template = sample();
        let flat = template.to_flat_array().unwrap();
        assert_eq!(flat.count(), 5);
        assert_eq!(flat.records()[2].ulValueLen, 1);
        assert_eq!(flat.to_template().unwrap(), template);
    }

    #[test]
    fn absent_entries_are_not_sent() {
        let template = sample().with(AttributeType::VALUE, AttributeValue::Absent);
        let flat = template.to_flat_array().unwrap();
        assert_eq!(flat.count(), 5);
    }

    #[test]
    fn kind_mismatch_is_rejected_locally() {
        let template = Template::new().with(AttributeType::VALUE_LEN, true);
        assert_eq!(
            template.to_flat_array().unwrap_err(),
            ValidationError::KindMismatch {
                attribute: AttributeType::VALUE_LEN,
                expected: AttributeKind::Integer,
                actual: AttributeKind::Boolean,
            }
        );
    }

    #[test]
    fn nested_templates_flatten_to_attribute_arrays() {
        let inner = Template::new()
            .with(AttributeType::EXTRACTABLE, false)
            .with(AttributeType::KEY_TYPE, 0x1f as CK_ULONG);
        let template = Template::new().with(AttributeType::UNWRAP_TEMPLATE, inner);
        let flat = template.to_flat_array().unwrap();
        assert_eq!(
            flat.records()[0].ulValueLen as usize,
            2 * mem::size_of::<CK_ATTRIBUTE>()
        );
        assert_eq!(flat.to_template().unwrap(), template);
    }

    #[test]
    fn unknown_types_survive_as_bytes() {
        let vendor = AttributeType::new(0x8000_1234);
        let template = Template::new().with(vendor, AttributeValue::Ulong(7));
        let flat = template.to_flat_array().unwrap();
        let back = flat.to_template().unwrap();
        assert_eq!(
            back.get(vendor),
            &AttributeValue::Bytes((7 as CK_ULONG).to_ne_bytes().to_vec())
        );
    }

    #[test]
    fn unavailable_marker_reads_back_as_absent() {
        let query = AttributeQuery::lengths(&[AttributeType::VALUE, AttributeType::LABEL]);
        assert!(query.records.iter().all(|record| record.pValue.is_null()));
        assert_eq!(
            query.reported(),
            vec![(AttributeType::VALUE, None), (AttributeType::LABEL, None)]
        );
        let records = query.records.clone();
        let template = unsafe { Template::from_flat_array(&records) }.unwrap();
        assert!(template.get(AttributeType::VALUE).is_absent());
        assert_eq!(template.len(), 2);
    }
}
