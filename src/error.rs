//! Error catalogue of the cryptographic-token API.
//!
//! Every operation on [`crate::p11::Module`] reports one of these kinds.
//! Card-level status words and transport failures are classified into this
//! catalogue at the point where they are observed; nothing is retried.

use thiserror::Error;

use crate::reader::TransportError;

/// Error kinds surfaced at the token API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CkError {
    #[error("library not initialized")]
    NotInitialized,

    #[error("library already initialized")]
    AlreadyInitialized,

    #[error("bad arguments")]
    ArgumentsBad,

    #[error("slot id invalid")]
    SlotIdInvalid,

    #[error("session handle invalid")]
    SessionHandleInvalid,

    #[error("object handle invalid")]
    ObjectHandleInvalid,

    #[error("device removed")]
    DeviceRemoved,

    #[error("token not present")]
    TokenNotPresent,

    #[error("token not recognized")]
    TokenNotRecognized,

    #[error("device error")]
    DeviceError,

    #[error("parallel sessions not supported")]
    SessionParallelNotSupported,

    #[error("a read/write SO session exists")]
    SessionReadWriteSoExists,

    #[error("a read-only session exists")]
    SessionReadOnlyExists,

    #[error("session is read-only")]
    SessionReadOnly,

    #[error("a session on the token exists")]
    SessionExists,

    #[error("user type invalid")]
    UserTypeInvalid,

    #[error("user already logged in")]
    UserAlreadyLoggedIn,

    #[error("user not logged in")]
    UserNotLoggedIn,

    #[error("user PIN not initialized")]
    UserPinNotInitialized,

    /// Wrong PIN; the card reports how many attempts remain.
    #[error("PIN incorrect, {tries_left} tries left")]
    PinIncorrect { tries_left: u8 },

    #[error("PIN blocked")]
    PinLocked,

    #[error("PIN has invalid length")]
    PinLenRange,

    #[error("attribute type invalid")]
    AttributeTypeInvalid,

    #[error("attribute is sensitive")]
    AttributeSensitive,

    #[error("attribute value invalid")]
    AttributeValueInvalid,

    #[error("buffer too small")]
    BufferTooSmall,

    #[error("template incomplete")]
    TemplateIncomplete,

    #[error("template inconsistent")]
    TemplateInconsistent,

    #[error("mechanism invalid")]
    MechanismInvalid,

    #[error("out of host memory")]
    HostMemory,

    #[error("function not supported")]
    FunctionNotSupported,

    #[error("function failed")]
    FunctionFailed,

    #[error("general error")]
    GeneralError,
}

pub type Result<T> = std::result::Result<T, CkError>;

/// Default classification of transport failures.
///
/// Call sites that can distinguish "card gone" from "reader gone" more
/// precisely (token detection, removal checks) map explicitly instead.
impl From<TransportError> for CkError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoCard => CkError::TokenNotPresent,
            TransportError::CardRemoved => CkError::DeviceRemoved,
            TransportError::ReaderGone => CkError::DeviceRemoved,
            TransportError::ServiceUnavailable => CkError::DeviceError,
            TransportError::Protocol(_) => CkError::DeviceError,
        }
    }
}
