//! FerroHSM core: an in-process software token with PKCS#11 semantics. It owns the
//! slot, session table, object registry and the symmetric mechanisms behind them;
//! the PKCS#11 client crate drives it through its C-ABI adapter.

pub mod attributes;
pub mod crypto;
pub mod error;
pub mod pkcs11;
pub mod session;

pub use attributes::{AttributeId, AttributeSet, AttributeTemplate, AttributeValue};
pub use error::{HsmError, HsmResult};
pub use session::{
    AttributeRead, MechanismSpec, ObjectDescriptor, ObjectHandle, OperationKind, SessionHandle,
    SessionSnapshot, SessionState, SlotDescriptor, SlotId, SoftToken,
};
