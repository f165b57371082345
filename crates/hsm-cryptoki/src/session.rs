//! Typed session operations over a [`NativeApi`].
//!
//! A [`Session`] borrows the module and an already opened session handle; it never
//! opens, logs in or closes sessions itself. Each operation kind has one slot
//! tracked by [`OperationSlots`], and every local check happens before the
//! corresponding native call is issued.
//!
//! A session is single-writer. Use one `Session` per thread; separate sessions over
//! the same module need no coordination here.

use cryptoki_sys::{
    CK_BYTE_PTR, CK_INVALID_HANDLE, CK_OBJECT_HANDLE, CK_RV, CK_ULONG, CK_ULONG_PTR,
    CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_OK,
};
use std::{collections::VecDeque, ptr};
use tracing::{debug, trace, warn};

use crate::{
    attribute::{AttributeKind, AttributeType},
    config::ClientConfig,
    error::{Error, Result, SequencingError, ValidationError},
    mechanism::{Mechanism, MechanismUsage},
    native::{NativeApi, ObjectHandle, SessionHandle},
    object::{Object, ObjectKind},
    operation::{OperationKind, OperationSlots, OperationState},
    rv::ReturnCode,
    template::{AttributeQuery, Template},
};

fn check(function: &'static str, rv: CK_RV, pending: Option<OperationKind>) -> Result<()> {
    let rv = ReturnCode::new(rv);
    if rv.is_ok() {
        Ok(())
    } else {
        debug!(function, %rv, ?pending, "native call failed");
        Err(Error::protocol(function, rv, pending))
    }
}

fn input(data: &[u8]) -> (CK_BYTE_PTR, CK_ULONG) {
    (data.as_ptr().cast_mut(), data.len() as CK_ULONG)
}

pub struct Session<'m> {
    api: &'m dyn NativeApi,
    handle: SessionHandle,
    slots: OperationSlots,
    config: ClientConfig,
}

impl<'m> Session<'m> {
    pub fn new(api: &'m dyn NativeApi, handle: SessionHandle) -> Self {
        Self::with_config(api, handle, ClientConfig::default())
    }

    pub fn with_config(api: &'m dyn NativeApi, handle: SessionHandle, config: ClientConfig) -> Self {
        Self {
            api,
            handle,
            slots: OperationSlots::default(),
            config,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn operation_state(&self, kind: OperationKind) -> OperationState {
        self.slots.state(kind)
    }

    pub fn active_operations(&self) -> Vec<OperationKind> {
        self.slots.active().collect()
    }

    fn bounded(&self, len: CK_ULONG) -> Result<usize> {
        let limit = self.config.max_output_len;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= limit)
            .ok_or_else(|| {
                ValidationError::LengthLimit {
                    length: len as u64,
                    limit,
                }
                .into()
            })
    }

    /// Length query with a null buffer, then the real call with a buffer of the
    /// reported size.
    fn read_output<F>(
        &self,
        function: &'static str,
        pending: Option<OperationKind>,
        mut call: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(CK_BYTE_PTR, CK_ULONG_PTR) -> CK_RV,
    {
        let mut len: CK_ULONG = 0;
        check(function, call(ptr::null_mut(), &mut len), pending)?;
        let mut output = vec![0u8; self.bounded(len)?];
        let mut len = output.len() as CK_ULONG;
        check(function, call(output.as_mut_ptr(), &mut len), pending)?;
        output.truncate(len as usize);
        Ok(output)
    }

    /// Idle -> Initialized for a cryptographic operation.
    pub fn init(
        &mut self,
        kind: OperationKind,
        mechanism: &Mechanism,
        key: Option<ObjectHandle>,
    ) -> Result<()> {
        let usage = kind
            .required_usage()
            .ok_or(SequencingError::NotStreaming(kind))?;
        mechanism.require(usage)?;
        match (kind.needs_key(), key) {
            (true, None) => return Err(ValidationError::MissingKey(kind).into()),
            (false, Some(_)) => return Err(ValidationError::UnexpectedKey(kind).into()),
            _ => {}
        }
        if !self.slots.is_idle(kind) {
            return Err(SequencingError::AlreadyActive(kind).into());
        }

        let session = self.handle.raw();
        let key = key.map_or(CK_INVALID_HANDLE, ObjectHandle::raw);
        let mut raw = mechanism.serialize();
        let mechanism_ptr = raw.as_mut_ptr();
        // SAFETY: the mechanism record and its parameter block live in `raw`.
        let (function, rv) = unsafe {
            match kind {
                OperationKind::Encrypt => (
                    "C_EncryptInit",
                    self.api.encrypt_init(session, mechanism_ptr, key),
                ),
                OperationKind::Decrypt => (
                    "C_DecryptInit",
                    self.api.decrypt_init(session, mechanism_ptr, key),
                ),
                OperationKind::Sign => ("C_SignInit", self.api.sign_init(session, mechanism_ptr, key)),
                OperationKind::Digest => ("C_DigestInit", self.api.digest_init(session, mechanism_ptr)),
                OperationKind::Find => return Err(SequencingError::NotStreaming(kind).into()),
            }
        };
        check(function, rv, None)?;
        self.slots.begin(kind)?;
        debug!(
            session = %self.handle,
            %kind,
            mechanism = %mechanism.mechanism_type(),
            "operation initialized"
        );
        Ok(())
    }

    /// Feeds one chunk. Returns whatever the token emits for it, which is always
    /// empty for sign and digest.
    pub fn update(&mut self, kind: OperationKind, chunk: &[u8]) -> Result<Vec<u8>> {
        self.slots.ensure_active(kind)?;
        let session = self.handle.raw();
        let (data, data_len) = input(chunk);
        let pending = Some(kind);
        // SAFETY: `chunk` outlives every call below and output buffers come from
        // `read_output`.
        let output = match kind {
            OperationKind::Encrypt => self.read_output("C_EncryptUpdate", pending, |out, out_len| unsafe {
                self.api.encrypt_update(session, data, data_len, out, out_len)
            })?,
            OperationKind::Decrypt => self.read_output("C_DecryptUpdate", pending, |out, out_len| unsafe {
                self.api.decrypt_update(session, data, data_len, out, out_len)
            })?,
            OperationKind::Sign => {
                let rv = unsafe { self.api.sign_update(session, data, data_len) };
                check("C_SignUpdate", rv, pending)?;
                Vec::new()
            }
            OperationKind::Digest => {
                let rv = unsafe { self.api.digest_update(session, data, data_len) };
                check("C_DigestUpdate", rv, pending)?;
                Vec::new()
            }
            OperationKind::Find => return Err(SequencingError::NotStreaming(kind).into()),
        };
        self.slots.advance(kind)?;
        trace!(
            session = %self.handle,
            %kind,
            input = chunk.len(),
            output = output.len(),
            "operation updated"
        );
        Ok(output)
    }

    /// Completes the operation and returns the trailing output: remaining cipher
    /// blocks, the signature or the digest.
    pub fn finish(&mut self, kind: OperationKind) -> Result<Vec<u8>> {
        self.slots.ensure_active(kind)?;
        let output = self.final_output(kind)?;
        self.slots.reset(kind);
        debug!(session = %self.handle, %kind, output = output.len(), "operation finished");
        Ok(output)
    }

    fn final_output(&self, kind: OperationKind) -> Result<Vec<u8>> {
        let session = self.handle.raw();
        let pending = Some(kind);
        // SAFETY: output buffers come from `read_output`.
        match kind {
            OperationKind::Encrypt => self.read_output("C_EncryptFinal", pending, |out, out_len| unsafe {
                self.api.encrypt_final(session, out, out_len)
            }),
            OperationKind::Decrypt => self.read_output("C_DecryptFinal", pending, |out, out_len| unsafe {
                self.api.decrypt_final(session, out, out_len)
            }),
            OperationKind::Sign => self.read_output("C_SignFinal", pending, |out, out_len| unsafe {
                self.api.sign_final(session, out, out_len)
            }),
            OperationKind::Digest => self.read_output("C_DigestFinal", pending, |out, out_len| unsafe {
                self.api.digest_final(session, out, out_len)
            }),
            OperationKind::Find => {
                check("C_FindObjectsFinal", self.api.find_objects_final(session), pending)?;
                Ok(Vec::new())
            }
        }
    }

    /// Forces the slot back to Idle. The token side is ended through its final
    /// function; output and failures of that call are discarded.
    pub fn abort(&mut self, kind: OperationKind) {
        if self.slots.is_idle(kind) {
            return;
        }
        if let Err(err) = self.final_output(kind) {
            warn!(session = %self.handle, %kind, error = %err, "ignoring failure while aborting operation");
        }
        self.slots.reset(kind);
        debug!(session = %self.handle, %kind, "operation aborted");
    }

    pub fn abort_all(&mut self) {
        for kind in OperationKind::ALL {
            self.abort(kind);
        }
    }

    /// init followed by the single-part native call, for input fully in memory.
    pub fn single_call(
        &mut self,
        kind: OperationKind,
        mechanism: &Mechanism,
        key: Option<ObjectHandle>,
        input_data: &[u8],
    ) -> Result<Vec<u8>> {
        self.init(kind, mechanism, key)?;
        let session = self.handle.raw();
        let (data, data_len) = input(input_data);
        let pending = Some(kind);
        // SAFETY: `input_data` outlives the calls and output buffers come from
        // `read_output`.
        let output = match kind {
            OperationKind::Encrypt => self.read_output("C_Encrypt", pending, |out, out_len| unsafe {
                self.api.encrypt(session, data, data_len, out, out_len)
            }),
            OperationKind::Decrypt => self.read_output("C_Decrypt", pending, |out, out_len| unsafe {
                self.api.decrypt(session, data, data_len, out, out_len)
            }),
            OperationKind::Sign => self.read_output("C_Sign", pending, |out, out_len| unsafe {
                self.api.sign(session, data, data_len, out, out_len)
            }),
            OperationKind::Digest => self.read_output("C_Digest", pending, |out, out_len| unsafe {
                self.api.digest(session, data, data_len, out, out_len)
            }),
            OperationKind::Find => Err(SequencingError::NotStreaming(kind).into()),
        }?;
        self.slots.reset(kind);
        debug!(
            session = %self.handle,
            %kind,
            input = input_data.len(),
            output = output.len(),
            "single-part operation complete"
        );
        Ok(output)
    }

    pub fn encrypt(&mut self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>> {
        self.single_call(OperationKind::Encrypt, mechanism, Some(key), data)
    }

    pub fn decrypt(&mut self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>> {
        self.single_call(OperationKind::Decrypt, mechanism, Some(key), data)
    }

    pub fn sign(&mut self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>> {
        self.single_call(OperationKind::Sign, mechanism, Some(key), data)
    }

    pub fn digest(&mut self, mechanism: &Mechanism, data: &[u8]) -> Result<Vec<u8>> {
        self.single_call(OperationKind::Digest, mechanism, None, data)
    }

    /// Generates a secret key. Only key-generation mechanisms known to this crate are
    /// accepted.
    pub fn generate_key(&self, mechanism: &Mechanism, template: &Template) -> Result<ObjectHandle> {
        if !mechanism
            .usage()
            .is_some_and(|usage| usage.contains(MechanismUsage::GENERATE))
        {
            return Err(ValidationError::MechanismNotPermitted {
                mechanism: mechanism.mechanism_type(),
                usage: "generate keys",
            }
            .into());
        }
        let object = Object::build(ObjectKind::SecretKey, template.clone(), false)?;
        let mut flat = object.as_template().to_flat_array()?;
        let mut raw = mechanism.serialize();
        let mut key: CK_OBJECT_HANDLE = CK_INVALID_HANDLE;
        // SAFETY: mechanism and template records own their buffers for the call.
        let rv = unsafe {
            self.api.generate_key(
                self.handle.raw(),
                raw.as_mut_ptr(),
                flat.as_mut_ptr(),
                flat.count(),
                &mut key,
            )
        };
        check("C_GenerateKey", rv, None)?;
        debug!(
            session = %self.handle,
            mechanism = %mechanism.mechanism_type(),
            key,
            "generated key"
        );
        Ok(ObjectHandle::new(key))
    }

    /// Wraps `key` under `wrapping_key`. Extractability is enforced by the token.
    pub fn wrap_key(
        &self,
        mechanism: &Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> Result<Vec<u8>> {
        mechanism.require(MechanismUsage::WRAP)?;
        let session = self.handle.raw();
        let mut raw = mechanism.serialize();
        let mechanism_ptr = raw.as_mut_ptr();
        // SAFETY: `raw` outlives both passes.
        let wrapped = self.read_output("C_WrapKey", None, |out, out_len| unsafe {
            self.api
                .wrap_key(session, mechanism_ptr, wrapping_key.raw(), key.raw(), out, out_len)
        })?;
        debug!(
            session = %self.handle,
            %wrapping_key,
            %key,
            len = wrapped.len(),
            "wrapped key"
        );
        Ok(wrapped)
    }

    /// Unwraps into a new object carrying the attributes of `template`.
    pub fn unwrap_key(
        &self,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &Template,
    ) -> Result<ObjectHandle> {
        mechanism.require(MechanismUsage::UNWRAP)?;
        let mut flat = template.to_flat_array()?;
        let mut raw = mechanism.serialize();
        let (data, data_len) = input(wrapped);
        let mut key: CK_OBJECT_HANDLE = CK_INVALID_HANDLE;
        // SAFETY: all pointers reference buffers alive for the duration of the call.
        let rv = unsafe {
            self.api.unwrap_key(
                self.handle.raw(),
                raw.as_mut_ptr(),
                unwrapping_key.raw(),
                data,
                data_len,
                flat.as_mut_ptr(),
                flat.count(),
                &mut key,
            )
        };
        check("C_UnwrapKey", rv, None)?;
        debug!(session = %self.handle, %unwrapping_key, key, "unwrapped key");
        Ok(ObjectHandle::new(key))
    }

    /// Creates an object whose kind is taken from CLASS. Mandatory attributes are
    /// checked when `strict_objects` is set.
    pub fn create_object(&self, template: &Template) -> Result<ObjectHandle> {
        let kind = template
            .get_ulong(AttributeType::CLASS)
            .map_or(ObjectKind::Generic, ObjectKind::from_class);
        let object = Object::build(kind, template.clone(), self.config.strict_objects)?;
        let mut flat = object.as_template().to_flat_array()?;
        let mut handle: CK_OBJECT_HANDLE = CK_INVALID_HANDLE;
        // SAFETY: `flat` owns every buffer its records point to.
        let rv = unsafe {
            self.api
                .create_object(self.handle.raw(), flat.as_mut_ptr(), flat.count(), &mut handle)
        };
        check("C_CreateObject", rv, None)?;
        debug!(session = %self.handle, %kind, object = handle, "created object");
        Ok(ObjectHandle::new(handle))
    }

    pub fn destroy_object(&self, object: ObjectHandle) -> Result<()> {
        check(
            "C_DestroyObject",
            self.api.destroy_object(self.handle.raw(), object.raw()),
            None,
        )?;
        debug!(session = %self.handle, %object, "destroyed object");
        Ok(())
    }

    /// `C_GetAttributeValue` may report per-attribute problems while still having
    /// filled in the rest.
    fn check_read(rv: CK_RV) -> Result<()> {
        match rv {
            CKR_OK | CKR_ATTRIBUTE_SENSITIVE | CKR_ATTRIBUTE_TYPE_INVALID => Ok(()),
            other => check("C_GetAttributeValue", other, None),
        }
    }

    /// First pass of an attribute read. `None` marks attributes the token will not
    /// reveal or does not have.
    pub fn query_attribute_lengths(
        &self,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<(AttributeType, Option<usize>)>> {
        if let Some(attribute) = types
            .iter()
            .find(|ty| ty.kind() == Some(AttributeKind::AttributeArray))
        {
            return Err(ValidationError::UnsupportedQuery {
                attribute: *attribute,
            }
            .into());
        }
        let mut query = AttributeQuery::lengths(types);
        // SAFETY: records carry null value pointers; only lengths are written.
        let rv = unsafe {
            self.api.get_attribute_value(
                self.handle.raw(),
                object.raw(),
                query.as_mut_ptr(),
                query.count(),
            )
        };
        Self::check_read(rv)?;
        let mut lengths = Vec::with_capacity(types.len());
        for (ty, len) in query.reported() {
            let len = match len {
                Some(len) => Some(self.bounded(len)?),
                None => None,
            };
            lengths.push((ty, len));
        }
        Ok(lengths)
    }

    /// Second pass: buffers of exactly the given sizes. A size smaller than the
    /// value fails with `CKR_BUFFER_TOO_SMALL`; nothing is truncated.
    ///
    /// Only attributes the first pass reported as readable belong here, so any sized
    /// buffer the token leaves unfilled is treated as too small, whichever
    /// per-attribute code the token chose to return.
    pub fn read_attribute_values(
        &self,
        object: ObjectHandle,
        requests: &[(AttributeType, usize)],
    ) -> Result<Template> {
        let mut query = AttributeQuery::values(requests);
        // SAFETY: every record points to a buffer of its stated length inside `query`.
        let rv = unsafe {
            self.api.get_attribute_value(
                self.handle.raw(),
                object.raw(),
                query.as_mut_ptr(),
                query.count(),
            )
        };
        Self::check_read(rv)?;
        if let Some(attribute) = query.unfilled() {
            debug!(session = %self.handle, %object, %attribute, "attribute buffer left unfilled");
            check("C_GetAttributeValue", CKR_BUFFER_TOO_SMALL, None)?;
            unreachable!("CKR_BUFFER_TOO_SMALL is never a success code");
        }
        Ok(query.into_template()?)
    }

    /// Both passes. Unavailable attributes come back `Absent`, in request order.
    pub fn get_attributes(&self, object: ObjectHandle, types: &[AttributeType]) -> Result<Template> {
        let lengths = self.query_attribute_lengths(object, types)?;
        let requests: Vec<(AttributeType, usize)> = lengths
            .iter()
            .filter_map(|(ty, len)| len.map(|len| (*ty, len)))
            .collect();
        let values = if requests.is_empty() {
            Template::new()
        } else {
            self.read_attribute_values(object, &requests)?
        };
        Ok(lengths
            .into_iter()
            .map(|(ty, _)| (ty, values.get(ty).clone()))
            .collect())
    }

    /// Reads CLASS, then every readable attribute of the matching schema.
    pub fn read_object(&self, object: ObjectHandle) -> Result<Object> {
        let class = self.get_attributes(object, &[AttributeType::CLASS])?;
        let kind = class
            .get_ulong(AttributeType::CLASS)
            .map_or(ObjectKind::Generic, ObjectKind::from_class);
        let types: Vec<AttributeType> = kind
            .schema()
            .iter()
            .map(|entry| entry.attribute)
            .filter(|ty| ty.kind() != Some(AttributeKind::AttributeArray))
            .collect();
        Ok(Object::discover(self.get_attributes(object, &types)?))
    }

    /// Starts a search. Present attributes must all match; the search is finalized
    /// when the returned iterator is exhausted or dropped.
    pub fn find_objects(&mut self, template: &Template) -> Result<FindObjects<'_, 'm>> {
        if !self.slots.is_idle(OperationKind::Find) {
            return Err(SequencingError::AlreadyActive(OperationKind::Find).into());
        }
        let mut flat = template.to_flat_array()?;
        // SAFETY: `flat` owns every buffer its records point to.
        let rv = unsafe {
            self.api
                .find_objects_init(self.handle.raw(), flat.as_mut_ptr(), flat.count())
        };
        check("C_FindObjectsInit", rv, None)?;
        self.slots.begin(OperationKind::Find)?;
        debug!(session = %self.handle, criteria = flat.count(), "search started");
        Ok(FindObjects {
            session: self,
            queued: VecDeque::new(),
            exhausted: false,
        })
    }

    pub fn find_all(&mut self, template: &Template) -> Result<Vec<ObjectHandle>> {
        self.find_objects(template)?.collect()
    }

    fn fetch_batch(&mut self) -> Result<Vec<ObjectHandle>> {
        let mut handles = vec![CK_INVALID_HANDLE; self.config.find_batch_size.max(1)];
        let mut count: CK_ULONG = 0;
        // SAFETY: `handles` has room for the advertised maximum.
        let rv = unsafe {
            self.api.find_objects(
                self.handle.raw(),
                handles.as_mut_ptr(),
                handles.len() as CK_ULONG,
                &mut count,
            )
        };
        check("C_FindObjects", rv, Some(OperationKind::Find))?;
        handles.truncate((count as usize).min(handles.len()));
        self.slots.advance(OperationKind::Find)?;
        trace!(session = %self.handle, batch = handles.len(), "search batch");
        Ok(handles.into_iter().map(ObjectHandle::new).collect())
    }
}

/// Lazy handle sequence of one search.
pub struct FindObjects<'s, 'm> {
    session: &'s mut Session<'m>,
    queued: VecDeque<ObjectHandle>,
    exhausted: bool,
}

impl Iterator for FindObjects<'_, '_> {
    type Item = Result<ObjectHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(handle) = self.queued.pop_front() {
                return Some(Ok(handle));
            }
            if self.exhausted {
                return None;
            }
            match self.session.fetch_batch() {
                Ok(batch) if batch.is_empty() => {
                    self.exhausted = true;
                    return self.session.finish(OperationKind::Find).err().map(Err);
                }
                Ok(batch) => self.queued.extend(batch),
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Drop for FindObjects<'_, '_> {
    fn drop(&mut self) {
        self.session.abort(OperationKind::Find);
    }
}
