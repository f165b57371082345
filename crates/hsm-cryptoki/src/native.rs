//! The native PKCS#11 function surface consumed by [`crate::Session`].
//!
//! [`NativeApi`] mirrors the C entry points one to one, raw pointers included, so
//! every implementation receives exactly the records a real module would.
//! [`FunctionList`] forwards to a `CK_FUNCTION_LIST` handed over by a loader.

use cryptoki_sys::{
    CK_ATTRIBUTE_PTR, CK_BYTE_PTR, CK_FUNCTION_LIST, CK_MECHANISM_PTR, CK_OBJECT_HANDLE,
    CK_OBJECT_HANDLE_PTR, CK_RV, CK_SESSION_HANDLE, CK_ULONG, CK_ULONG_PTR,
    CKR_FUNCTION_NOT_SUPPORTED,
};
use std::{fmt, ptr::NonNull};

/// Handle of an open session, owned by whoever opened it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle(CK_SESSION_HANDLE);

impl SessionHandle {
    pub const fn new(raw: CK_SESSION_HANDLE) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> CK_SESSION_HANDLE {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Token-owned object reference. Never dereferenced on this side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(CK_OBJECT_HANDLE);

impl ObjectHandle {
    pub const fn new(raw: CK_OBJECT_HANDLE) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> CK_OBJECT_HANDLE {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Raw PKCS#11 entry points used by this crate.
///
/// # Safety
///
/// Every `unsafe` method has the contract of the C function of the same name:
/// pointers must be valid for the lengths passed alongside them, and output
/// pointers must be writable.
#[allow(clippy::too_many_arguments)]
pub trait NativeApi: Send + Sync {
    unsafe fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
        object: CK_OBJECT_HANDLE_PTR,
    ) -> CK_RV;

    fn destroy_object(&self, session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE) -> CK_RV;

    unsafe fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
    ) -> CK_RV;

    unsafe fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
    ) -> CK_RV;

    unsafe fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        objects: CK_OBJECT_HANDLE_PTR,
        max_objects: CK_ULONG,
        object_count: CK_ULONG_PTR,
    ) -> CK_RV;

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> CK_RV;

    unsafe fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
        key: CK_OBJECT_HANDLE_PTR,
    ) -> CK_RV;

    unsafe fn wrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        wrapping_key: CK_OBJECT_HANDLE,
        key: CK_OBJECT_HANDLE,
        wrapped: CK_BYTE_PTR,
        wrapped_len: CK_ULONG_PTR,
    ) -> CK_RV;

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
    ) -> CK_RV;

    unsafe fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV;

    unsafe fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn encrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV;

    unsafe fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn decrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn decrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV;

    unsafe fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        signature: CK_BYTE_PTR,
        signature_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn sign_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
    ) -> CK_RV;

    unsafe fn sign_final(
        &self,
        session: CK_SESSION_HANDLE,
        signature: CK_BYTE_PTR,
        signature_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn digest_init(&self, session: CK_SESSION_HANDLE, mechanism: CK_MECHANISM_PTR)
    -> CK_RV;

    unsafe fn digest(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        digest: CK_BYTE_PTR,
        digest_len: CK_ULONG_PTR,
    ) -> CK_RV;

    unsafe fn digest_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
    ) -> CK_RV;

    unsafe fn digest_final(
        &self,
        session: CK_SESSION_HANDLE,
        digest: CK_BYTE_PTR,
        digest_len: CK_ULONG_PTR,
    ) -> CK_RV;
}

/// [`NativeApi`] over a module's `CK_FUNCTION_LIST`.
///
/// Entries the module leaves empty answer `CKR_FUNCTION_NOT_SUPPORTED`.
pub struct FunctionList {
    list: NonNull<CK_FUNCTION_LIST>,
}

// SAFETY: a PKCS#11 function list is immutable once published, and modules
// initialized for multi-threaded use accept calls from any thread.
unsafe impl Send for FunctionList {}
unsafe impl Sync for FunctionList {}

impl FunctionList {
    /// # Safety
    ///
    /// `list` must come from `C_GetFunctionList` of an initialized module and stay
    /// valid for the lifetime of the returned value.
    pub unsafe fn from_raw(list: *const CK_FUNCTION_LIST) -> Option<Self> {
        NonNull::new(list.cast_mut()).map(|list| Self { list })
    }

    fn entries(&self) -> &CK_FUNCTION_LIST {
        // SAFETY: validity is part of the `from_raw` contract.
        unsafe { self.list.as_ref() }
    }
}

impl fmt::Debug for FunctionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionList")
            .field("list", &self.list)
            .finish()
    }
}

macro_rules! dispatch {
    ($self:ident, $entry:ident($($arg:expr),* $(,)?)) => {
        match $self.entries().$entry {
            // SAFETY: forwarded under the caller's contract for this entry point.
            Some(function) => unsafe { function($($arg),*) },
            None => CKR_FUNCTION_NOT_SUPPORTED,
        }
    };
}

impl NativeApi for FunctionList {
    unsafe fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
        object: CK_OBJECT_HANDLE_PTR,
    ) -> CK_RV {
        dispatch!(self, C_CreateObject(session, template, count, object))
    }

    fn destroy_object(&self, session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE) -> CK_RV {
        dispatch!(self, C_DestroyObject(session, object))
    }

    unsafe fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
    ) -> CK_RV {
        dispatch!(self, C_GetAttributeValue(session, object, template, count))
    }

    unsafe fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
    ) -> CK_RV {
        dispatch!(self, C_FindObjectsInit(session, template, count))
    }

    unsafe fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        objects: CK_OBJECT_HANDLE_PTR,
        max_objects: CK_ULONG,
        object_count: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_FindObjects(session, objects, max_objects, object_count))
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> CK_RV {
        dispatch!(self, C_FindObjectsFinal(session))
    }

    unsafe fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
        key: CK_OBJECT_HANDLE_PTR,
    ) -> CK_RV {
        dispatch!(self, C_GenerateKey(session, mechanism, template, count, key))
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
        dispatch!(
            self,
            C_WrapKey(session, mechanism, wrapping_key, key, wrapped, wrapped_len)
        )
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
        dispatch!(
            self,
            C_UnwrapKey(
                session,
                mechanism,
                unwrapping_key,
                wrapped,
                wrapped_len,
                template,
                count,
                key,
            )
        )
    }

    unsafe fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV {
        dispatch!(self, C_EncryptInit(session, mechanism, key))
    }

    unsafe fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_Encrypt(session, data, data_len, out, out_len))
    }

    unsafe fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_EncryptUpdate(session, data, data_len, out, out_len))
    }

    unsafe fn encrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_EncryptFinal(session, out, out_len))
    }

    unsafe fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV {
        dispatch!(self, C_DecryptInit(session, mechanism, key))
    }

    unsafe fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_Decrypt(session, data, data_len, out, out_len))
    }

    unsafe fn decrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_DecryptUpdate(session, data, data_len, out, out_len))
    }

    unsafe fn decrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        out: CK_BYTE_PTR,
        out_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_DecryptFinal(session, out, out_len))
    }

    unsafe fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV {
        dispatch!(self, C_SignInit(session, mechanism, key))
    }

    unsafe fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        signature: CK_BYTE_PTR,
        signature_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_Sign(session, data, data_len, signature, signature_len))
    }

    unsafe fn sign_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
    ) -> CK_RV {
        dispatch!(self, C_SignUpdate(session, data, data_len))
    }

    unsafe fn sign_final(
        &self,
        session: CK_SESSION_HANDLE,
        signature: CK_BYTE_PTR,
        signature_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_SignFinal(session, signature, signature_len))
    }

    unsafe fn digest_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_PTR,
    ) -> CK_RV {
        dispatch!(self, C_DigestInit(session, mechanism))
    }

    unsafe fn digest(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
        digest: CK_BYTE_PTR,
        digest_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_Digest(session, data, data_len, digest, digest_len))
    }

    unsafe fn digest_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: CK_BYTE_PTR,
        data_len: CK_ULONG,
    ) -> CK_RV {
        dispatch!(self, C_DigestUpdate(session, data, data_len))
    }

    unsafe fn digest_final(
        &self,
        session: CK_SESSION_HANDLE,
        digest: CK_BYTE_PTR,
        digest_len: CK_ULONG_PTR,
    ) -> CK_RV {
        dispatch!(self, C_DigestFinal(session, digest, digest_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::{CKR_OK, CKR_SESSION_HANDLE_INVALID};
    use std::{mem, ptr};

    unsafe extern "C" fn digest_init_on_seven(
        session: CK_SESSION_HANDLE,
        _mechanism: CK_MECHANISM_PTR,
    ) -> CK_RV {
        if session == 7 {
            CKR_OK
        } else {
            CKR_SESSION_HANDLE_INVALID
        }
    }

    #[test]
    fn null_list_is_rejected() {
        assert!(unsafe { FunctionList::from_raw(ptr::null()) }.is_none());
    }

    #[test]
    fn empty_entries_are_not_supported() {
        let list: CK_FUNCTION_LIST = unsafe { mem::zeroed() };
        let functions = unsafe { FunctionList::from_raw(&list) }.unwrap();
        assert_eq!(functions.find_objects_final(1), CKR_FUNCTION_NOT_SUPPORTED);
        assert_eq!(functions.destroy_object(1, 2), CKR_FUNCTION_NOT_SUPPORTED);
    }

    #[test]
    fn populated_entries_are_called() {
        let mut list: CK_FUNCTION_LIST = unsafe { mem::zeroed() };
        list.C_DigestInit = Some(digest_init_on_seven);
        let functions = unsafe { FunctionList::from_raw(&list) }.unwrap();
        assert_eq!(unsafe { functions.digest_init(7, ptr::null_mut()) }, CKR_OK);
        assert_eq!(
            unsafe { functions.digest_init(8, ptr::null_mut()) },
            CKR_SESSION_HANDLE_INVALID
        );
    }
}
