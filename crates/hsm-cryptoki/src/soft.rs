//! [`NativeApi`] backed by the in-process FerroHSM software token.
//!
//! Input arrives exactly as a C module would receive it: raw `CK_ATTRIBUTE` arrays,
//! `CK_MECHANISM` records with parameter pointers, and caller-owned output buffers
//! with length pointers. Output buffers follow the usual convention: a null buffer
//! asks for the length, a short buffer gets `CKR_BUFFER_TOO_SMALL` together with the
//! required length, and neither consumes operation state.

use cryptoki_sys::*;
use hsm_core::{
    AttributeRead, AttributeSet, AttributeTemplate, HsmError, HsmResult, MechanismSpec,
    OperationKind as TokenOperation, SoftToken, attributes::AttributeValue as TokenValue,
};
use std::{ptr, slice, sync::Arc};
use tracing::{debug, error};

use crate::{
    attribute::{AttributeType, AttributeValue},
    mechanism::MechanismType,
    native::{NativeApi, SessionHandle},
    template::Template,
};

/// Maps a token failure onto its PKCS#11 return code.
pub fn translate_error(err: HsmError) -> CK_RV {
    match err {
        HsmError::SessionHandleInvalid(_) => CKR_SESSION_HANDLE_INVALID,
        HsmError::SessionReadOnly => CKR_SESSION_READ_ONLY,
        HsmError::UserNotLoggedIn => CKR_USER_NOT_LOGGED_IN,
        HsmError::UserAlreadyLoggedIn => CKR_USER_ALREADY_LOGGED_IN,
        HsmError::ObjectHandleInvalid(_) => CKR_OBJECT_HANDLE_INVALID,
        HsmError::KeyHandleInvalid(_) => CKR_KEY_HANDLE_INVALID,
        HsmError::WrappingKeyHandleInvalid(_) => CKR_WRAPPING_KEY_HANDLE_INVALID,
        HsmError::UnwrappingKeyHandleInvalid(_) => CKR_UNWRAPPING_KEY_HANDLE_INVALID,
        HsmError::OperationActive => CKR_OPERATION_ACTIVE,
        HsmError::OperationNotInitialized => CKR_OPERATION_NOT_INITIALIZED,
        HsmError::MechanismInvalid(_) => CKR_MECHANISM_INVALID,
        HsmError::MechanismParamInvalid(_) => CKR_MECHANISM_PARAM_INVALID,
        HsmError::KeyTypeInconsistent => CKR_KEY_TYPE_INCONSISTENT,
        HsmError::KeyFunctionNotPermitted => CKR_KEY_FUNCTION_NOT_PERMITTED,
        HsmError::KeyUnextractable => CKR_KEY_UNEXTRACTABLE,
        HsmError::KeyNotWrappable => CKR_KEY_NOT_WRAPPABLE,
        HsmError::KeySizeRange(_) => CKR_KEY_SIZE_RANGE,
        HsmError::TemplateIncomplete(_) => CKR_TEMPLATE_INCOMPLETE,
        HsmError::TemplateInconsistent(_) => CKR_TEMPLATE_INCONSISTENT,
        HsmError::AttributeReadOnly(_) => CKR_ATTRIBUTE_READ_ONLY,
        HsmError::AttributeTypeInvalid(_) => CKR_ATTRIBUTE_TYPE_INVALID,
        HsmError::AttributeValueInvalid(_) => CKR_ATTRIBUTE_VALUE_INVALID,
        HsmError::DataLenRange => CKR_DATA_LEN_RANGE,
        HsmError::EncryptedDataInvalid => CKR_ENCRYPTED_DATA_INVALID,
        HsmError::EncryptedDataLenRange => CKR_ENCRYPTED_DATA_LEN_RANGE,
        HsmError::WrappedKeyInvalid => CKR_WRAPPED_KEY_INVALID,
        HsmError::Crypto(msg) => {
            error!("soft token cryptography failure: {msg}");
            CKR_FUNCTION_FAILED
        }
        HsmError::Unexpected(msg) => {
            error!("soft token internal error: {msg}");
            CKR_GENERAL_ERROR
        }
    }
}

fn to_rv(result: HsmResult<()>) -> CK_RV {
    result.map_or_else(translate_error, |()| CKR_OK)
}

fn to_token_value(ty: AttributeType, value: AttributeValue) -> Result<Option<TokenValue>, CK_RV> {
    Ok(Some(match value {
        AttributeValue::Absent => return Ok(None),
        AttributeValue::Bool(flag) => TokenValue::Bool(flag),
        AttributeValue::Ulong(number) => TokenValue::Uint(number as u64),
        AttributeValue::Bytes(bytes) => TokenValue::Bytes(bytes),
        date @ AttributeValue::Date(_) => TokenValue::Bytes(date.encode()),
        AttributeValue::Mechanisms(list) => {
            TokenValue::Mechanisms(list.into_iter().map(|m| m.raw() as u64).collect())
        }
        AttributeValue::Attributes(_) => {
            debug!(attribute = %ty, "nested templates are not stored by the soft token");
            return Err(CKR_ATTRIBUTE_TYPE_INVALID);
        }
    }))
}

fn from_token_value(value: &TokenValue) -> AttributeValue {
    match value {
        TokenValue::Bool(flag) => AttributeValue::Bool(*flag),
        TokenValue::Uint(number) => AttributeValue::Ulong(*number as CK_ULONG),
        TokenValue::Bytes(bytes) => AttributeValue::Bytes(bytes.clone()),
        TokenValue::Mechanisms(list) => AttributeValue::Mechanisms(
            list.iter()
                .map(|code| MechanismType::new(*code as CK_MECHANISM_TYPE))
                .collect(),
        ),
    }
}

/// # Safety
///
/// `template` must point to `count` valid records, or be null with `count == 0`.
unsafe fn read_template(
    template: CK_ATTRIBUTE_PTR,
    count: CK_ULONG,
) -> Result<Vec<(u64, TokenValue)>, CK_RV> {
    if template.is_null() {
        return if count == 0 { Ok(Vec::new()) } else { Err(CKR_ARGUMENTS_BAD) };
    }
    let records = unsafe { slice::from_raw_parts(template, count as usize) };
    let decoded = unsafe { Template::from_flat_array(records) }.map_err(|err| {
        debug!(%err, "rejected malformed template");
        CKR_ATTRIBUTE_VALUE_INVALID
    })?;
    let mut entries = Vec::with_capacity(decoded.len());
    for (ty, value) in decoded.iter() {
        if let Some(value) = to_token_value(ty, value.clone())? {
            entries.push((ty.raw() as u64, value));
        }
    }
    Ok(entries)
}

/// # Safety
///
/// Same contract as [`read_template`].
unsafe fn read_attribute_set(template: CK_ATTRIBUTE_PTR, count: CK_ULONG) -> Result<AttributeSet, CK_RV> {
    let mut attributes = AttributeSet::new();
    for (id, value) in unsafe { read_template(template, count) }? {
        attributes.insert(id, value);
    }
    Ok(attributes)
}

/// # Safety
///
/// `mechanism` must be null or point to a valid record whose parameter pointer
/// covers `ulParameterLen` bytes.
unsafe fn read_mechanism(mechanism: CK_MECHANISM_PTR) -> Option<MechanismSpec> {
    let record = unsafe { mechanism.as_ref() }?;
    let parameter = if record.pParameter.is_null() || record.ulParameterLen == 0 {
        Vec::new()
    } else {
        unsafe {
            slice::from_raw_parts(record.pParameter as *const u8, record.ulParameterLen as usize)
        }
        .to_vec()
    };
    Some(MechanismSpec::new(record.mechanism as u64, parameter))
}

/// # Safety
///
/// `data` must be null with `len == 0` or point to `len` readable bytes.
unsafe fn read_input<'a>(data: CK_BYTE_PTR, len: CK_ULONG) -> Option<&'a [u8]> {
    if data.is_null() {
        (len == 0).then_some(&[][..])
    } else {
        Some(unsafe { slice::from_raw_parts(data, len as usize) })
    }
}

/// Writes token output through the C buffer convention. `produce(false)` must not
/// change token state.
///
/// # Safety
///
/// `out_len` must be null or writable; `out` must be null or hold `*out_len` bytes.
unsafe fn write_output<F>(out: CK_BYTE_PTR, out_len: CK_ULONG_PTR, produce: F) -> CK_RV
where
    F: Fn(bool) -> HsmResult<Vec<u8>>,
{
    let Some(len_slot) = (unsafe { out_len.as_mut() }) else {
        return CKR_ARGUMENTS_BAD;
    };
    let preview = match produce(false) {
        Ok(preview) => preview,
        Err(err) => return translate_error(err),
    };
    if out.is_null() {
        *len_slot = preview.len() as CK_ULONG;
        return CKR_OK;
    }
    if (*len_slot as usize) < preview.len() {
        *len_slot = preview.len() as CK_ULONG;
        return CKR_BUFFER_TOO_SMALL;
    }
    match produce(true) {
        Ok(output) => {
            unsafe { ptr::copy_nonoverlapping(output.as_ptr(), out, output.len()) };
            *len_slot = output.len() as CK_ULONG;
            CKR_OK
        }
        Err(err) => translate_error(err),
    }
}

/// The software token seen through its raw PKCS#11 surface.
#[derive(Clone, Default)]
pub struct SoftModule {
    token: Arc<SoftToken>,
}

impl SoftModule {
    pub fn new(token: Arc<SoftToken>) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &Arc<SoftToken> {
        &self.token
    }

    pub fn open_session(&self, read_only: bool) -> SessionHandle {
        SessionHandle::new(self.token.open_session(read_only) as CK_SESSION_HANDLE)
    }

    pub fn close_session(&self, session: SessionHandle) -> HsmResult<()> {
        self.token.close_session(session.raw() as u64)
    }

    pub fn login(&self, session: SessionHandle) -> HsmResult<()> {
        self.token.login(session.raw() as u64)
    }

    pub fn logout(&self, session: SessionHandle) -> HsmResult<()> {
        self.token.logout(session.raw() as u64)
    }

    unsafe fn operation_init(
        &self,
        session: CK_SESSION_HANDLE,
        kind: TokenOperation,
        mechanism: CK_MECHANISM_PTR,
        key: Option<CK_OBJECT_HANDLE>,
    ) -> CK_RV {
        let Some(spec) = (unsafe { read_mechanism(mechanism) }) else {
            return CKR_ARGUMENTS_BAD;
        };
        to_rv(
            self.token
                .operation_init(session as u64, kind, &spec, key.map(|key| key as u64)),
        )
    }

    unsafe fn operation_single(
        &self,
        session: CK_SESSION_HANDLE,
        kind: TokenOperation,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        let Some(data) = (unsafe { read_input(data, data_len) }) else {
            return CKR_ARGUMENTS_BAD;
        };
        unsafe {
            write_output(out, out_len, |commit| {
                self.token.operation_single(session as u64, kind, data, commit)
            })
        }
    }

    unsafe fn operation_update(
        &self,
        session: CK_SESSION_HANDLE,
        kind: TokenOperation,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        let Some(data) = (unsafe { read_input(data, data_len) }) else {
            return CKR_ARGUMENTS_BAD;
        };
        unsafe {
            write_output(out, out_len, |commit| {
                self.token.operation_update(session as u64, kind, data, commit)
            })
        }
    }

    /// Update for operations that produce no output until they finish.
    unsafe fn operation_absorb(
        &self,
        session: CK_SESSION_HANDLE,
        kind: TokenOperation,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
    ) -> CK_RV {
        let Some(data) = (unsafe { read_input(data, data_len) }) else {
            return CKR_ARGUMENTS_BAD;
        };
        to_rv(
            self.token
                .operation_update(session as u64, kind, data, true)
                .map(|_| ()),
        )
    }

    unsafe fn operation_final(
        &self,
        session: CK_SESSION_HANDLE,
        kind: TokenOperation,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe {
            write_output(out, out_len, |commit| {
                self.token.operation_final(session as u64, kind, commit)
            })
        }
    }

    fn attribute_value(read: &AttributeRead) -> Result<Vec<u8>, CK_RV> {
        match read {
            AttributeRead::Value(value) => Ok(from_token_value(value).encode()),
            AttributeRead::Sensitive => Err(CKR_ATTRIBUTE_SENSITIVE),
            AttributeRead::Invalid => Err(CKR_ATTRIBUTE_TYPE_INVALID),
        }
    }
}

impl NativeApi for SoftModule {
    unsafe fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
        object: CK_OBJECT_HANDLE_PTR,
    ) -> CK_RV {
        let Some(object) = (unsafe { object.as_mut() }) else {
            return CKR_ARGUMENTS_BAD;
        };
        let attributes = match unsafe { read_attribute_set(template, count) } {
            Ok(attributes) => attributes,
            Err(rv) => return rv,
        };
        match self.token.create_object(session as u64, attributes) {
            Ok(handle) => {
                *object = handle as CK_OBJECT_HANDLE;
                CKR_OK
            }
            Err(err) => translate_error(err),
        }
    }

    fn destroy_object(&self, session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE) -> CK_RV {
        to_rv(self.token.destroy_object(session as u64, object as u64))
    }

    unsafe fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
    ) -> CK_RV {
        if template.is_null() && count != 0 {
            return CKR_ARGUMENTS_BAD;
        }
        let records: &mut [CK_ATTRIBUTE] = if count == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(template, count as usize) }
        };
        let ids: Vec<u64> = records.iter().map(|record| record.type_ as u64).collect();
        let reads = match self.token.read_attributes(session as u64, object as u64, &ids) {
            Ok(reads) => reads,
            Err(err) => return translate_error(err),
        };

        // Every record is processed. A short buffer outranks per-attribute refusals.
        let mut rv = CKR_OK;
        for (record, read) in records.iter_mut().zip(&reads) {
            let value = match Self::attribute_value(read) {
                Ok(value) => value,
                Err(code) => {
                    record.ulValueLen = CK_UNAVAILABLE_INFORMATION;
                    if rv != CKR_BUFFER_TOO_SMALL {
                        rv = code;
                    }
                    continue;
                }
            };
            if record.pValue.is_null() {
                record.ulValueLen = value.len() as CK_ULONG;
            } else if (record.ulValueLen as usize) < value.len() {
                record.ulValueLen = CK_UNAVAILABLE_INFORMATION;
                rv = CKR_BUFFER_TOO_SMALL;
            } else {
                unsafe {
                    ptr::copy_nonoverlapping(value.as_ptr(), record.pValue as *mut u8, value.len())
                };
                record.ulValueLen = value.len() as CK_ULONG;
            }
        }
        rv
    }

    unsafe fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
    ) -> CK_RV {
        match unsafe { read_template(template, count) } {
            Ok(entries) => {
                let criteria: AttributeTemplate = entries.into_iter().collect();
                to_rv(self.token.find_objects_init(session as u64, criteria))
            }
            Err(rv) => rv,
        }
    }

    unsafe fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        objects: CK_OBJECT_HANDLE_PTR,
        max_objects: CK_ULONG,
        object_count: CK_ULONG_PTR,
    ) -> CK_RV {
        if objects.is_null() || object_count.is_null() {
            return CKR_ARGUMENTS_BAD;
        }
        match self.token.find_objects(session as u64, max_objects as usize) {
            Ok(found) => {
                let out = unsafe { slice::from_raw_parts_mut(objects, found.len()) };
                for (slot, handle) in out.iter_mut().zip(&found) {
                    *slot = *handle as CK_OBJECT_HANDLE;
                }
                unsafe { *object_count = found.len() as CK_ULONG };
                CKR_OK
            }
            Err(err) => translate_error(err),
        }
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> CK_RV {
        to_rv(self.token.find_objects_final(session as u64))
    }

    unsafe fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
        key: CK_OBJECT_HANDLE_PTR,
    ) -> CK_RV {
        let (Some(spec), Some(key)) = (unsafe { read_mechanism(mechanism) }, unsafe { key.as_mut() })
        else {
            return CKR_ARGUMENTS_BAD;
        };
        let attributes = match unsafe { read_attribute_set(template, count) } {
            Ok(attributes) => attributes,
            Err(rv) => return rv,
        };
        match self.token.generate_key(session as u64, &spec, attributes) {
            Ok(handle) => {
                *key = handle as CK_OBJECT_HANDLE;
                CKR_OK
            }
            Err(err) => translate_error(err),
        }
    }

    unsafe fn wrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        wrapping_key: CK_OBJECT_HANDLE,
        key: CK_OBJECT_HANDLE,
        wrapped: CK_BYTE_PTR,
        wrapped_len: CK_ULONG_PTR,
    ) -> CK_RV {
        let Some(spec) = (unsafe { read_mechanism(mechanism) }) else {
            return CKR_ARGUMENTS_BAD;
        };
        unsafe {
            write_output(wrapped, wrapped_len, |_| {
                self.token
                    .wrap_key(session as u64, &spec, wrapping_key as u64, key as u64)
            })
        }
    }

    unsafe fn unwrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        unwrapping_key: CK_OBJECT_HANDLE,
        wrapped: CK_BYTE_PTR,
        wrapped_len: CK_ULONG,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
        key: CK_OBJECT_HANDLE_PTR,
    ) -> CK_RV {
        let (Some(spec), Some(wrapped), Some(key)) = (
            unsafe { read_mechanism(mechanism) },
            unsafe { read_input(wrapped, wrapped_len) },
            unsafe { key.as_mut() },
        ) else {
            return CKR_ARGUMENTS_BAD;
        };
        let attributes = match unsafe { read_attribute_set(template, count) } {
            Ok(attributes) => attributes,
            Err(rv) => return rv,
        };
        match self
            .token
            .unwrap_key(session as u64, &spec, unwrapping_key as u64, wrapped, attributes)
        {
            Ok(handle) => {
                *key = handle as CK_OBJECT_HANDLE;
                debug!(session, key = *key, "unwrapped key through soft module");
                CKR_OK
            }
            Err(err) => translate_error(err),
        }
    }

    unsafe fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV {
        unsafe { self.operation_init(session, TokenOperation::Encrypt, mechanism, Some(key)) }
    }

    unsafe fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe {
            self.operation_single(session, TokenOperation::Encrypt, data, data_len, out, out_len)
        }
    }

    unsafe fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe {
            self.operation_update(session, TokenOperation::Encrypt, data, data_len, out, out_len)
        }
    }

    unsafe fn encrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe { self.operation_final(session, TokenOperation::Encrypt, out, out_len) }
    }

    unsafe fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV {
        unsafe { self.operation_init(session, TokenOperation::Decrypt, mechanism, Some(key)) }
    }

    unsafe fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe {
            self.operation_single(session, TokenOperation::Decrypt, data, data_len, out, out_len)
        }
    }

    unsafe fn decrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe {
            self.operation_update(session, TokenOperation::Decrypt, data, data_len, out, out_len)
        }
    }

    unsafe fn decrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe { self.operation_final(session, TokenOperation::Decrypt, out, out_len) }
    }

    unsafe fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV {
        unsafe { self.operation_init(session, TokenOperation::Sign, mechanism, Some(key)) }
    }

    unsafe fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        signature: CK_BYTE_PTR,
        signature_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe {
            self.operation_single(
                session,
                TokenOperation::Sign,
                data,
                data_len,
                signature,
                signature_len,
            )
        }
    }

    unsafe fn sign_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
    ) -> CK_RV {
        unsafe { self.operation_absorb(session, TokenOperation::Sign, data, data_len) }
    }

    unsafe fn sign_final(
        &self,
        session: CK_SESSION_HANDLE,
        signature: CK_BYTE_PTR,
        signature_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe { self.operation_final(session, TokenOperation::Sign, signature, signature_len) }
    }

    unsafe fn digest_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
    ) -> CK_RV {
        unsafe { self.operation_init(session, TokenOperation::Digest, mechanism, None) }
    }

    unsafe fn digest(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        digest: CK_BYTE_PTR,
        digest_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe {
            self.operation_single(
                session,
                TokenOperation::Digest,
                data,
                data_len,
                digest,
                digest_len,
            )
        }
    }

    unsafe fn digest_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
    ) -> CK_RV {
        unsafe { self.operation_absorb(session, TokenOperation::Digest, data, data_len) }
    }

    unsafe fn digest_final(
        &self,
        session: CK_SESSION_HANDLE,
        digest: CK_BYTE_PTR,
        digest_len: CK_ULONG_PTR,
    ) -> CK_RV {
        unsafe { self.operation_final(session, TokenOperation::Digest, digest, digest_len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_in() -> (SoftModule, CK_SESSION_HANDLE) {
        let module = SoftModule::default();
        let session = module.open_session(false);
        module.login(session).unwrap();
        (module, session.raw())
    }

    fn aes_key(module: &SoftModule, session: CK_SESSION_HANDLE) -> CK_OBJECT_HANDLE {
        let template = Template::new()
            .with(AttributeType::VALUE_LEN, 16 as CK_ULONG)
            .with(AttributeType::ENCRYPT, true)
            .with(AttributeType::SENSITIVE, true);
        let mut flat = template.to_flat_array().unwrap();
        let mut mechanism = CK_MECHANISM {
            mechanism: CKM_AES_KEY_GEN,
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        let mut key = CK_INVALID_HANDLE;
        let rv = unsafe {
            module.generate_key(session, &mut mechanism, flat.as_mut_ptr(), flat.count(), &mut key)
        };
        assert_eq!(rv, CKR_OK);
        key
    }

    #[test]
    fn errors_translate_to_matching_codes() {
        assert_eq!(translate_error(HsmError::KeyUnextractable), CKR_KEY_UNEXTRACTABLE);
        assert_eq!(translate_error(HsmError::TemplateIncomplete(0x161)), CKR_TEMPLATE_INCOMPLETE);
        assert_eq!(translate_error(HsmError::Unexpected("boom".into())), CKR_GENERAL_ERROR);
    }

    #[test]
    fn attribute_reads_follow_the_buffer_convention() {
        let (module, session) = logged_in();
        let key = aes_key(&module, session);

        let mut records = [
            CK_ATTRIBUTE {
                type_: CKA_VALUE_LEN,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            },
            CK_ATTRIBUTE {
                type_: CKA_VALUE,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            },
            CK_ATTRIBUTE {
                type_: CKA_MODULUS,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            },
        ];
        let rv = unsafe {
            module.get_attribute_value(session, key, records.as_mut_ptr(), records.len() as CK_ULONG)
        };
        assert!(rv == CKR_ATTRIBUTE_SENSITIVE || rv == CKR_ATTRIBUTE_TYPE_INVALID);
        assert_eq!(records[0].ulValueLen as usize, std::mem::size_of::<CK_ULONG>());
        assert_eq!(records[1].ulValueLen, CK_UNAVAILABLE_INFORMATION);
        assert_eq!(records[2].ulValueLen, CK_UNAVAILABLE_INFORMATION);

        let mut short = [0u8; 2];
        let mut record = CK_ATTRIBUTE {
            type_: CKA_VALUE_LEN,
            pValue: short.as_mut_ptr() as CK_VOID_PTR,
            ulValueLen: short.len() as CK_ULONG,
        };
        let rv = unsafe { module.get_attribute_value(session, key, &mut record, 1) };
        assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
        assert_eq!(record.ulValueLen, CK_UNAVAILABLE_INFORMATION);

        let mut hidden = [0u8; 16];
        let mut mixed = [
            record,
            CK_ATTRIBUTE {
                type_: CKA_VALUE,
                pValue: hidden.as_mut_ptr() as CK_VOID_PTR,
                ulValueLen: hidden.len() as CK_ULONG,
            },
        ];
        mixed[0].ulValueLen = short.len() as CK_ULONG;
        let rv = unsafe { module.get_attribute_value(session, key, mixed.as_mut_ptr(), 2) };
        assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
        mixed.reverse();
        mixed[0].ulValueLen = hidden.len() as CK_ULONG;
        mixed[1].ulValueLen = short.len() as CK_ULONG;
        let rv = unsafe { module.get_attribute_value(session, key, mixed.as_mut_ptr(), 2) };
        assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
    }

    #[test]
    fn length_queries_leave_the_operation_running() {
        let (module, session) = logged_in();
        let key = aes_key(&module, session);
        let iv = [0u8; 16];
        let mut mechanism = CK_MECHANISM {
            mechanism: CKM_AES_CBC_PAD,
            pParameter: iv.as_ptr() as CK_VOID_PTR,
            ulParameterLen: iv.len() as CK_ULONG,
        };
        assert_eq!(unsafe { module.encrypt_init(session, &mut mechanism, key) }, CKR_OK);

        let mut data = *b"twenty bytes of data";
        let mut needed: CK_ULONG = 0;
        let rv = unsafe {
            module.encrypt(
                session,
                data.as_mut_ptr(),
                data.len() as CK_ULONG,
                ptr::null_mut(),
                &mut needed,
            )
        };
        assert_eq!(rv, CKR_OK);
        assert_eq!(needed, 32);

        let mut out = vec![0u8; 31];
        let mut len = out.len() as CK_ULONG;
        let rv = unsafe {
            module.encrypt(session, data.as_mut_ptr(), data.len() as CK_ULONG, out.as_mut_ptr(), &mut len)
        };
        assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
        assert_eq!(len, 32);

        out.resize(32, 0);
        let mut len = out.len() as CK_ULONG;
        let rv = unsafe {
            module.encrypt(session, data.as_mut_ptr(), data.len() as CK_ULONG, out.as_mut_ptr(), &mut len)
        };
        assert_eq!(rv, CKR_OK);
        assert_eq!(len, 32);
        assert!(module.token().session(session as u64).unwrap().active.is_empty());
    }

    #[test]
    fn missing_length_pointer_is_rejected() {
        let (module, session) = logged_in();
        let rv = unsafe { module.digest_final(session, ptr::null_mut(), ptr::null_mut()) };
        assert_eq!(rv, CKR_ARGUMENTS_BAD);
    }
}
