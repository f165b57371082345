//! FerroHSM PKCS#11 client layer.
//!
//! Typed attribute templates and object schemas, mechanism binding with checked
//! parameters, and a per-session operation state machine, all driven through the
//! raw [`NativeApi`] surface. Native return codes are classified into [`Outcome`]s
//! without losing the original `CK_RV`.
//!
//! With the `soft-token` feature, [`soft::SoftModule`] exposes the in-process
//! FerroHSM token through that same surface.

pub mod attribute;
pub mod config;
pub mod error;
pub mod mechanism;
pub mod native;
pub mod object;
pub mod operation;
pub mod rv;
pub mod session;
#[cfg(feature = "soft-token")]
pub mod soft;
pub mod template;

pub use attribute::{AttributeKind, AttributeType, AttributeValue};
pub use config::{ClientConfig, ConfigError};
pub use error::{Error, Result, SequencingError, ValidationError};
pub use mechanism::{Mechanism, MechanismParams, MechanismType, MechanismUsage, ParameterKind};
pub use native::{FunctionList, NativeApi, ObjectHandle, SessionHandle};
pub use object::{Object, ObjectKind};
pub use operation::{OperationKind, OperationState};
pub use rv::{Outcome, ReturnCode};
pub use session::{FindObjects, Session};
pub use template::Template;

pub use cryptoki_sys;
