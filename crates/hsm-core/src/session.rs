use crate::{
    attributes::{AttributeId, AttributeSet, AttributeTemplate, AttributeValue},
    crypto::{self, CbcStream, DigestStream, Direction, MacStream},
    error::{HsmError, HsmResult},
    pkcs11::{attribute, class, key_type, mechanism},
};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};
use tracing::{debug, info};
use uuid::Uuid;

pub type SlotId = u64;
pub type SessionHandle = u64;
pub type ObjectHandle = u64;

/// Largest generic secret the token will generate or import, in bytes.
const MAX_GENERIC_SECRET_LEN: usize = 512;

#[derive(Clone, Debug)]
pub struct SlotDescriptor {
    pub slot_id: SlotId,
    pub label: String,
    pub manufacturer: String,
    pub serial: String,
}

/// Cryptographic operation families that can be active on a session at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    Sign,
    Digest,
}

/// Mechanism identifier together with its parameter block as raw bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MechanismSpec {
    pub mechanism: u64,
    pub parameter: Vec<u8>,
}

impl MechanismSpec {
    pub fn new(mechanism: u64, parameter: impl Into<Vec<u8>>) -> Self {
        Self {
            mechanism,
            parameter: parameter.into(),
        }
    }

    fn expect_no_parameter(&self) -> HsmResult<()> {
        if self.parameter.is_empty() {
            Ok(())
        } else {
            Err(HsmError::param(format!(
                "mechanism {:#x} takes no parameter",
                self.mechanism
            )))
        }
    }

    /// Whether this is one of the AES-CBC variants, and if so whether it pads.
    fn cbc_padding(&self) -> Option<bool> {
        match self.mechanism {
            mechanism::AES_CBC => Some(false),
            mechanism::AES_CBC_PAD => Some(true),
            _ => None,
        }
    }
}

/// Result of reading a single attribute from an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeRead {
    Value(AttributeValue),
    /// The attribute exists but may not be revealed.
    Sensitive,
    /// The object has no such attribute.
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Public,
    User,
}

/// Point-in-time view of a session for callers and tests.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub slot_id: SlotId,
    pub read_only: bool,
    pub state: SessionState,
    pub opened_at: Instant,
    pub objects: Vec<ObjectHandle>,
    pub searching: bool,
    pub active: Vec<OperationKind>,
}

#[derive(Clone)]
enum ActiveOperation {
    Cipher(CbcStream),
    Digest(DigestStream),
    Mac(MacStream),
}

impl ActiveOperation {
    fn update(&mut self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Cipher(stream) => stream.update(data),
            Self::Digest(stream) => {
                stream.update(data);
                Vec::new()
            }
            Self::Mac(stream) => {
                stream.update(data);
                Vec::new()
            }
        }
    }

    fn finish(self) -> HsmResult<Vec<u8>> {
        match self {
            Self::Cipher(stream) => stream.finish(),
            Self::Digest(stream) => Ok(stream.finish()),
            Self::Mac(stream) => Ok(stream.finish()),
        }
    }
}

struct SessionInfo {
    read_only: bool,
    state: SessionState,
    opened_at: Instant,
    objects: Vec<ObjectHandle>,
    search: Option<SearchCursor>,
    operations: HashMap<OperationKind, ActiveOperation>,
}

impl SessionInfo {
    fn logged_in(&self) -> bool {
        self.state == SessionState::User
    }
}

#[derive(Clone, Debug)]
pub struct ObjectDescriptor {
    pub handle: ObjectHandle,
    pub attributes: AttributeSet,
    pub token_object: bool,
    pub owner: SessionHandle,
}

impl ObjectDescriptor {
    fn is_private(&self) -> bool {
        matches!(
            self.attributes.get(attribute::PRIVATE),
            Some(AttributeValue::Bool(true))
        )
    }

    fn class(&self) -> Option<u64> {
        match self.attributes.get(attribute::CLASS) {
            Some(AttributeValue::Uint(code)) => Some(*code),
            _ => None,
        }
    }

    fn secret_value(&self) -> HsmResult<&[u8]> {
        self.attributes
            .bytes(attribute::VALUE)?
            .ok_or(HsmError::KeyTypeInconsistent)
    }

    fn ensure_key_type(&self, allowed: &[u64]) -> HsmResult<()> {
        let key_type = self.attributes.uint(attribute::KEY_TYPE)?;
        if self.class() == Some(class::SECRET_KEY) && key_type.is_some_and(|k| allowed.contains(&k))
        {
            Ok(())
        } else {
            Err(HsmError::KeyTypeInconsistent)
        }
    }

    fn ensure_permits(&self, flag: AttributeId) -> HsmResult<()> {
        if self.attributes.flag(flag)? {
            Ok(())
        } else {
            Err(HsmError::KeyFunctionNotPermitted)
        }
    }

    /// VALUE of sensitive or non-extractable keys never leaves the token.
    fn conceals(&self, id: AttributeId) -> bool {
        let is_key = matches!(self.class(), Some(class::SECRET_KEY | class::PRIVATE_KEY));
        id == attribute::VALUE
            && is_key
            && (self.attributes.flag(attribute::SENSITIVE).unwrap_or(true)
                || !self.attributes.flag(attribute::EXTRACTABLE).unwrap_or(false))
    }
}

#[derive(Clone, Debug)]
struct SearchCursor {
    queue: VecDeque<ObjectHandle>,
}

/// In-process PKCS#11 token: one slot, its sessions, and the object registry.
pub struct SoftToken {
    slot: SlotDescriptor,
    sessions: RwLock<HashMap<SessionHandle, SessionInfo>>,
    objects: RwLock<HashMap<ObjectHandle, ObjectDescriptor>>,
    next_session: AtomicU64,
    next_object: AtomicU64,
}

impl Default for SoftToken {
    fn default() -> Self {
        Self::new("FerroHSM soft token")
    }
}

impl SoftToken {
    pub fn new(label: impl Into<String>) -> Self {
        let serial = Uuid::new_v4().simple().to_string();
        Self {
            slot: SlotDescriptor {
                slot_id: 0,
                label: label.into(),
                manufacturer: "FerroHSM".into(),
                serial: serial[..16].to_string(),
            },
            sessions: RwLock::new(HashMap::new()),
            objects: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
        }
    }

    pub fn slot(&self) -> &SlotDescriptor {
        &self.slot
    }

    pub fn supports_mechanism(&self, mechanism: u64) -> bool {
        mechanism::SUPPORTED.contains(&mechanism)
    }

    pub fn open_session(&self, read_only: bool) -> SessionHandle {
        let handle = self.next_session.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo {
            read_only,
            state: SessionState::Public,
            opened_at: Instant::now(),
            objects: Vec::new(),
            search: None,
            operations: HashMap::new(),
        };
        self.sessions.write().insert(handle, info);
        debug!(session = handle, read_only, "opened session");
        handle
    }

    pub fn close_session(&self, handle: SessionHandle) -> HsmResult<()> {
        let session = self
            .sessions
            .write()
            .remove(&handle)
            .ok_or(HsmError::SessionHandleInvalid(handle))?;
        if !session.objects.is_empty() {
            let mut registry = self.objects.write();
            for object in session.objects {
                registry.remove(&object);
            }
        }
        debug!(session = handle, "closed session");
        Ok(())
    }

    pub fn login(&self, handle: SessionHandle) -> HsmResult<()> {
        let mut guard = self.sessions.write();
        let session = guard
            .get_mut(&handle)
            .ok_or(HsmError::SessionHandleInvalid(handle))?;
        if session.logged_in() {
            return Err(HsmError::UserAlreadyLoggedIn);
        }
        session.state = SessionState::User;
        Ok(())
    }

    pub fn logout(&self, handle: SessionHandle) -> HsmResult<()> {
        let mut guard = self.sessions.write();
        let session = guard
            .get_mut(&handle)
            .ok_or(HsmError::SessionHandleInvalid(handle))?;
        if !session.logged_in() {
            return Err(HsmError::UserNotLoggedIn);
        }
        session.state = SessionState::Public;
        session.search = None;
        session.operations.clear();
        Ok(())
    }

    pub fn session(&self, handle: SessionHandle) -> HsmResult<SessionSnapshot> {
        let guard = self.sessions.read();
        let info = guard
            .get(&handle)
            .ok_or(HsmError::SessionHandleInvalid(handle))?;
        Ok(SessionSnapshot {
            slot_id: self.slot.slot_id,
            read_only: info.read_only,
            state: info.state.clone(),
            opened_at: info.opened_at,
            objects: info.objects.clone(),
            searching: info.search.is_some(),
            active: info.operations.keys().copied().collect(),
        })
    }

    /// C_CreateObject semantics: secret keys need CLASS, KEY_TYPE and VALUE; other
    /// classes are stored as supplied.
    pub fn create_object(
        &self,
        session: SessionHandle,
        mut attributes: AttributeSet,
    ) -> HsmResult<ObjectHandle> {
        attributes.ensure_absent(attribute::TOKEN_MANAGED)?;
        let object_class = attributes
            .uint(attribute::CLASS)?
            .ok_or(HsmError::TemplateIncomplete(attribute::CLASS))?;
        match object_class {
            class::SECRET_KEY => {
                attributes.validate_required(&[attribute::KEY_TYPE, attribute::VALUE])?;
                let key_type = attributes.uint(attribute::KEY_TYPE)?.unwrap_or_default();
                let len = attributes.bytes(attribute::VALUE)?.map_or(0, <[u8]>::len);
                if attributes
                    .uint(attribute::VALUE_LEN)?
                    .is_some_and(|declared| declared != len as u64)
                {
                    return Err(HsmError::inconsistent("VALUE_LEN differs from VALUE"));
                }
                check_secret_len(key_type, len)
                    .map_err(|_| HsmError::AttributeValueInvalid(attribute::VALUE))?;
                attributes.insert(attribute::VALUE_LEN, AttributeValue::Uint(len as u64));
                finish_secret_key(&mut attributes, false);
            }
            class::DATA | class::CERTIFICATE | class::PUBLIC_KEY => {
                apply_storage_defaults(&mut attributes, false);
            }
            class::PRIVATE_KEY => apply_storage_defaults(&mut attributes, true),
            _ => return Err(HsmError::AttributeValueInvalid(attribute::CLASS)),
        }
        let handle = self.store_object(session, attributes)?;
        info!(session, object = handle, class = object_class, "created object");
        Ok(handle)
    }

    pub fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> HsmResult<()> {
        let mut sessions = self.sessions.write();
        let info = sessions
            .get(&session)
            .ok_or(HsmError::SessionHandleInvalid(session))?;
        let mut registry = self.objects.write();
        let descriptor = visible(info, session, &registry, object)
            .ok_or(HsmError::ObjectHandleInvalid(object))?;
        if descriptor.token_object && info.read_only {
            return Err(HsmError::SessionReadOnly);
        }
        let owner = descriptor.owner;
        registry.remove(&object);
        if let Some(owner) = sessions.get_mut(&owner) {
            owner.objects.retain(|handle| *handle != object);
        }
        info!(session, object, "destroyed object");
        Ok(())
    }

    /// Reads the requested attributes from one consistent view of the object.
    pub fn read_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        ids: &[AttributeId],
    ) -> HsmResult<Vec<AttributeRead>> {
        let sessions = self.sessions.read();
        let info = sessions
            .get(&session)
            .ok_or(HsmError::SessionHandleInvalid(session))?;
        let registry = self.objects.read();
        let descriptor = visible(info, session, &registry, object)
            .ok_or(HsmError::ObjectHandleInvalid(object))?;
        Ok(ids
            .iter()
            .map(|id| match descriptor.attributes.get(*id) {
                None => AttributeRead::Invalid,
                Some(_) if descriptor.conceals(*id) => AttributeRead::Sensitive,
                Some(value) => AttributeRead::Value(value.clone()),
            })
            .collect())
    }

    pub fn generate_key(
        &self,
        session: SessionHandle,
        mech: &MechanismSpec,
        mut attributes: AttributeSet,
    ) -> HsmResult<ObjectHandle> {
        let generated_type = match mech.mechanism {
            mechanism::AES_KEY_GEN => key_type::AES,
            mechanism::GENERIC_SECRET_KEY_GEN => key_type::GENERIC_SECRET,
            other => return Err(HsmError::MechanismInvalid(other)),
        };
        mech.expect_no_parameter()?;
        attributes.ensure_absent(attribute::TOKEN_MANAGED)?;
        if attributes.contains(attribute::VALUE) {
            return Err(HsmError::inconsistent("VALUE is generated by the token"));
        }
        if attributes
            .uint(attribute::CLASS)?
            .is_some_and(|c| c != class::SECRET_KEY)
        {
            return Err(HsmError::inconsistent("key generation produces secret keys"));
        }
        if attributes
            .uint(attribute::KEY_TYPE)?
            .is_some_and(|k| k != generated_type)
        {
            return Err(HsmError::inconsistent("KEY_TYPE does not match mechanism"));
        }
        let len = attributes
            .uint(attribute::VALUE_LEN)?
            .ok_or(HsmError::TemplateIncomplete(attribute::VALUE_LEN))? as usize;
        check_secret_len(generated_type, len)?;

        attributes.insert(attribute::CLASS, AttributeValue::Uint(class::SECRET_KEY));
        attributes.insert(attribute::KEY_TYPE, AttributeValue::Uint(generated_type));
        attributes.insert(attribute::VALUE, AttributeValue::Bytes(crypto::random_bytes(len)));
        attributes.insert(
            attribute::KEY_GEN_MECHANISM,
            AttributeValue::Uint(mech.mechanism),
        );
        finish_secret_key(&mut attributes, true);

        let handle = self.store_object(session, attributes)?;
        info!(session, object = handle, mechanism = mech.mechanism, len, "generated secret key");
        Ok(handle)
    }

    pub fn wrap_key(
        &self,
        session: SessionHandle,
        mech: &MechanismSpec,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> HsmResult<Vec<u8>> {
        let padded = mech
            .cbc_padding()
            .ok_or(HsmError::MechanismInvalid(mech.mechanism))?;
        let sessions = self.sessions.read();
        let info = sessions
            .get(&session)
            .ok_or(HsmError::SessionHandleInvalid(session))?;
        let registry = self.objects.read();
        let wrapping = visible(info, session, &registry, wrapping_key)
            .ok_or(HsmError::WrappingKeyHandleInvalid(wrapping_key))?;
        let target =
            visible(info, session, &registry, key).ok_or(HsmError::KeyHandleInvalid(key))?;

        wrapping.ensure_key_type(&[key_type::AES])?;
        wrapping.ensure_permits(attribute::WRAP)?;
        if target.class() != Some(class::SECRET_KEY) {
            return Err(HsmError::KeyNotWrappable);
        }
        if !target.attributes.flag(attribute::EXTRACTABLE)? {
            return Err(HsmError::KeyUnextractable);
        }

        let wrapped = CbcStream::oneshot(
            Direction::Encrypt,
            wrapping.secret_value()?,
            &mech.parameter,
            padded,
            target.secret_value()?,
        )
        .map_err(|err| match err {
            HsmError::DataLenRange => HsmError::KeySizeRange(wrapped_len_hint(target)),
            other => other,
        })?;
        debug!(session, wrapping_key, key, len = wrapped.len(), "wrapped key");
        Ok(wrapped)
    }

    pub fn unwrap_key(
        &self,
        session: SessionHandle,
        mech: &MechanismSpec,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        mut attributes: AttributeSet,
    ) -> HsmResult<ObjectHandle> {
        let padded = mech
            .cbc_padding()
            .ok_or(HsmError::MechanismInvalid(mech.mechanism))?;
        attributes.ensure_absent(attribute::TOKEN_MANAGED)?;
        if attributes.contains(attribute::VALUE) {
            return Err(HsmError::inconsistent("VALUE comes from the wrapped key"));
        }
        let object_class = attributes
            .uint(attribute::CLASS)?
            .ok_or(HsmError::TemplateIncomplete(attribute::CLASS))?;
        if object_class != class::SECRET_KEY {
            return Err(HsmError::inconsistent("only secret keys can be unwrapped"));
        }
        let unwrapped_type = attributes
            .uint(attribute::KEY_TYPE)?
            .ok_or(HsmError::TemplateIncomplete(attribute::KEY_TYPE))?;

        let value = {
            let sessions = self.sessions.read();
            let info = sessions
                .get(&session)
                .ok_or(HsmError::SessionHandleInvalid(session))?;
            let registry = self.objects.read();
            let unwrapping = visible(info, session, &registry, unwrapping_key)
                .ok_or(HsmError::UnwrappingKeyHandleInvalid(unwrapping_key))?;
            unwrapping.ensure_key_type(&[key_type::AES])?;
            unwrapping.ensure_permits(attribute::UNWRAP)?;
            CbcStream::oneshot(
                Direction::Decrypt,
                unwrapping.secret_value()?,
                &mech.parameter,
                padded,
                wrapped,
            )
            .map_err(|err| match err {
                HsmError::EncryptedDataInvalid | HsmError::EncryptedDataLenRange => {
                    HsmError::WrappedKeyInvalid
                }
                other => other,
            })?
        };

        check_secret_len(unwrapped_type, value.len()).map_err(|_| HsmError::WrappedKeyInvalid)?;
        if attributes
            .uint(attribute::VALUE_LEN)?
            .is_some_and(|len| len as usize != value.len())
        {
            return Err(HsmError::inconsistent("VALUE_LEN differs from unwrapped key"));
        }
        attributes.insert(attribute::VALUE_LEN, AttributeValue::Uint(value.len() as u64));
        attributes.insert(attribute::VALUE, AttributeValue::Bytes(value));
        finish_secret_key(&mut attributes, false);

        let handle = self.store_object(session, attributes)?;
        info!(session, object = handle, unwrapping_key, "unwrapped key");
        Ok(handle)
    }

    pub fn find_objects_init(
        &self,
        session_handle: SessionHandle,
        template: AttributeTemplate,
    ) -> HsmResult<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_handle)
            .ok_or(HsmError::SessionHandleInvalid(session_handle))?;
        if session.search.is_some() {
            return Err(HsmError::OperationActive);
        }

        let registry = self.objects.read();
        let viewer: &SessionInfo = session;
        let mut matches: Vec<ObjectHandle> = registry
            .values()
            .filter(|descriptor| is_visible(viewer, session_handle, descriptor))
            .filter(|descriptor| {
                template.is_empty() || descriptor.attributes.matches_template(&template)
            })
            .map(|descriptor| descriptor.handle)
            .collect();
        matches.sort_unstable();
        debug!(
            session = session_handle,
            criteria = template.entries().len(),
            matches = matches.len(),
            "search initialized"
        );
        session.search = Some(SearchCursor {
            queue: matches.into(),
        });
        Ok(())
    }

    pub fn find_objects(
        &self,
        session_handle: SessionHandle,
        max_objects: usize,
    ) -> HsmResult<Vec<ObjectHandle>> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_handle)
            .ok_or(HsmError::SessionHandleInvalid(session_handle))?;
        let cursor = session
            .search
            .as_mut()
            .ok_or(HsmError::OperationNotInitialized)?;
        let take = max_objects.min(cursor.queue.len());
        Ok(cursor.queue.drain(..take).collect())
    }

    pub fn find_objects_final(&self, session_handle: SessionHandle) -> HsmResult<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_handle)
            .ok_or(HsmError::SessionHandleInvalid(session_handle))?;
        session
            .search
            .take()
            .map(|_| ())
            .ok_or(HsmError::OperationNotInitialized)
    }

    pub fn operation_init(
        &self,
        session_handle: SessionHandle,
        kind: OperationKind,
        mech: &MechanismSpec,
        key: Option<ObjectHandle>,
    ) -> HsmResult<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_handle)
            .ok_or(HsmError::SessionHandleInvalid(session_handle))?;
        if session.operations.contains_key(&kind) {
            return Err(HsmError::OperationActive);
        }
        let operation = {
            let registry = self.objects.read();
            let key = match key {
                Some(handle) => Some(
                    visible(session, session_handle, &registry, handle)
                        .ok_or(HsmError::KeyHandleInvalid(handle))?,
                ),
                None => None,
            };
            start_operation(kind, mech, key)?
        };
        session.operations.insert(kind, operation);
        debug!(session = session_handle, ?kind, mechanism = mech.mechanism, "operation initialized");
        Ok(())
    }

    /// Feeds `data` into the active operation. With `commit == false` the output is
    /// computed on a copy of the context and the session is left untouched, which is
    /// how output-length queries are answered.
    pub fn operation_update(
        &self,
        session_handle: SessionHandle,
        kind: OperationKind,
        data: &[u8],
        commit: bool,
    ) -> HsmResult<Vec<u8>> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_handle)
            .ok_or(HsmError::SessionHandleInvalid(session_handle))?;
        let operation = session
            .operations
            .get_mut(&kind)
            .ok_or(HsmError::OperationNotInitialized)?;
        if commit {
            Ok(operation.update(data))
        } else {
            Ok(operation.clone().update(data))
        }
    }

    pub fn operation_final(
        &self,
        session_handle: SessionHandle,
        kind: OperationKind,
        commit: bool,
    ) -> HsmResult<Vec<u8>> {
        self.complete(session_handle, kind, None, commit)
    }

    /// Single-part form: the whole input followed by finalization.
    pub fn operation_single(
        &self,
        session_handle: SessionHandle,
        kind: OperationKind,
        data: &[u8],
        commit: bool,
    ) -> HsmResult<Vec<u8>> {
        self.complete(session_handle, kind, Some(data), commit)
    }

    fn complete(
        &self,
        session_handle: SessionHandle,
        kind: OperationKind,
        data: Option<&[u8]>,
        commit: bool,
    ) -> HsmResult<Vec<u8>> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_handle)
            .ok_or(HsmError::SessionHandleInvalid(session_handle))?;
        let mut operation = session
            .operations
            .get(&kind)
            .cloned()
            .ok_or(HsmError::OperationNotInitialized)?;
        let mut output = data.map(|data| operation.update(data)).unwrap_or_default();
        let result = operation.finish().map(|tail| {
            output.extend(tail);
            output
        });
        if commit || result.is_err() {
            session.operations.remove(&kind);
            debug!(session = session_handle, ?kind, ok = result.is_ok(), "operation finished");
        }
        result
    }

    fn store_object(
        &self,
        session_handle: SessionHandle,
        attributes: AttributeSet,
    ) -> HsmResult<ObjectHandle> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_handle)
            .ok_or(HsmError::SessionHandleInvalid(session_handle))?;
        let token_object = attributes.flag(attribute::TOKEN)?;
        if token_object && session.read_only {
            return Err(HsmError::SessionReadOnly);
        }
        if attributes.flag(attribute::PRIVATE)? && !session.logged_in() {
            return Err(HsmError::UserNotLoggedIn);
        }
        let handle = self.next_object.fetch_add(1, Ordering::Relaxed);
        let descriptor = ObjectDescriptor {
            handle,
            attributes,
            token_object,
            owner: session_handle,
        };
        self.objects.write().insert(handle, descriptor);
        if !token_object {
            session.objects.push(handle);
        }
        Ok(handle)
    }
}

fn is_visible(session: &SessionInfo, handle: SessionHandle, descriptor: &ObjectDescriptor) -> bool {
    let in_scope = descriptor.token_object || descriptor.owner == handle;
    in_scope && (session.logged_in() || !descriptor.is_private())
}

fn visible<'r>(
    session: &SessionInfo,
    handle: SessionHandle,
    registry: &'r HashMap<ObjectHandle, ObjectDescriptor>,
    object: ObjectHandle,
) -> Option<&'r ObjectDescriptor> {
    registry
        .get(&object)
        .filter(|descriptor| is_visible(session, handle, descriptor))
}

fn start_operation(
    kind: OperationKind,
    mech: &MechanismSpec,
    key: Option<&ObjectDescriptor>,
) -> HsmResult<ActiveOperation> {
    let require_key = || key.ok_or(HsmError::KeyHandleInvalid(0));
    match (kind, mech.mechanism) {
        (OperationKind::Digest, mechanism::SHA256) => {
            mech.expect_no_parameter()?;
            Ok(ActiveOperation::Digest(DigestStream::default()))
        }
        (OperationKind::Sign, mechanism::SHA256_HMAC) => {
            mech.expect_no_parameter()?;
            let key = require_key()?;
            key.ensure_key_type(&[key_type::GENERIC_SECRET, key_type::AES])?;
            key.ensure_permits(attribute::SIGN)?;
            Ok(ActiveOperation::Mac(MacStream::new(key.secret_value()?)?))
        }
        (OperationKind::Encrypt | OperationKind::Decrypt, mechanism::AES_CBC | mechanism::AES_CBC_PAD) => {
            let key = require_key()?;
            key.ensure_key_type(&[key_type::AES])?;
            let (direction, flag) = match kind {
                OperationKind::Encrypt => (Direction::Encrypt, attribute::ENCRYPT),
                _ => (Direction::Decrypt, attribute::DECRYPT),
            };
            key.ensure_permits(flag)?;
            let padded = mech.mechanism == mechanism::AES_CBC_PAD;
            let stream = CbcStream::new(direction, key.secret_value()?, &mech.parameter, padded)?;
            Ok(ActiveOperation::Cipher(stream))
        }
        (_, other) => Err(HsmError::MechanismInvalid(other)),
    }
}

fn check_secret_len(secret_type: u64, len: usize) -> HsmResult<()> {
    let valid = match secret_type {
        key_type::AES => crypto::is_aes_key_len(len),
        key_type::GENERIC_SECRET => (1..=MAX_GENERIC_SECRET_LEN).contains(&len),
        _ => return Err(HsmError::inconsistent(format!("unsupported key type {secret_type:#x}"))),
    };
    if valid {
        Ok(())
    } else {
        Err(HsmError::KeySizeRange(len))
    }
}

fn wrapped_len_hint(target: &ObjectDescriptor) -> usize {
    target
        .attributes
        .uint(attribute::VALUE_LEN)
        .ok()
        .flatten()
        .unwrap_or_default() as usize
}

/// Defaults shared by every stored object.
fn apply_storage_defaults(attributes: &mut AttributeSet, private: bool) {
    attributes.insert_default(attribute::TOKEN, AttributeValue::Bool(false));
    attributes.insert_default(attribute::PRIVATE, AttributeValue::Bool(private));
    attributes.insert_default(attribute::MODIFIABLE, AttributeValue::Bool(true));
    attributes.insert_default(attribute::LABEL, AttributeValue::Bytes(Vec::new()));
    attributes.insert(
        attribute::UNIQUE_ID,
        AttributeValue::Bytes(Uuid::new_v4().to_string().into_bytes()),
    );
}

/// Fills in secret-key defaults and the attributes the token derives itself.
fn finish_secret_key(attributes: &mut AttributeSet, local: bool) {
    apply_storage_defaults(attributes, true);
    for flag in [
        attribute::ENCRYPT,
        attribute::DECRYPT,
        attribute::SIGN,
        attribute::VERIFY,
        attribute::WRAP,
        attribute::UNWRAP,
        attribute::DERIVE,
        attribute::SENSITIVE,
    ] {
        attributes.insert_default(flag, AttributeValue::Bool(false));
    }
    attributes.insert_default(attribute::EXTRACTABLE, AttributeValue::Bool(true));
    attributes.insert_default(attribute::ID, AttributeValue::Bytes(Vec::new()));

    let sensitive = attributes.flag(attribute::SENSITIVE).unwrap_or(false);
    let extractable = attributes.flag(attribute::EXTRACTABLE).unwrap_or(true);
    attributes.insert(attribute::LOCAL, AttributeValue::Bool(local));
    attributes.insert(
        attribute::ALWAYS_SENSITIVE,
        AttributeValue::Bool(local && sensitive),
    );
    attributes.insert(
        attribute::NEVER_EXTRACTABLE,
        AttributeValue::Bool(local && !extractable),
    );
}
