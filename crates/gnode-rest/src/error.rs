use gnode_shared::{LifecycleState, LocalId};
use gnode_store::StoreError;
use serde_json::{json, Value};
use thiserror::Error;

use crate::messages::MessageType;

/// Errors produced while handling a REST request.
///
/// Everything except [`RestError::Store`] is a client error detected before
/// any write is committed.
#[derive(Error, Debug)]
pub enum RestError {
    /// Request body is not a JSON object.
    #[error("Data parsing error: {0}")]
    DataParsing(String),

    /// A query parameter could not be parsed or is unknown.
    #[error("Wrong parameters: {0}")]
    WrongParams(String),

    /// An attribute or reference value fails validation.
    #[error("Bad parameter '{field}': {details}")]
    BadParameter { field: String, details: String },

    /// Body names a field the entity type does not have.
    #[error("Invalid post data: {0}")]
    PostDataInvalid(String),

    #[error("Bad float data in '{field}': {details}")]
    BadFloatData { field: String, details: String },

    /// Reference target missing, of the wrong type, or not readable.
    #[error("Wrong reference in '{field}': {target}")]
    WrongReference { field: String, target: LocalId },

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Object does not exist")]
    DoesNotExist,

    #[error("Unknown object type: {0}")]
    InvalidObjectType(String),

    #[error("Cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Method not supported")]
    InvalidMethod,

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl RestError {
    pub fn bad_parameter(field: &str, details: impl Into<String>) -> Self {
        Self::BadParameter {
            field: field.to_string(),
            details: details.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::DataParsing(_) => MessageType::DataParsingError,
            Self::WrongParams(_) => MessageType::WrongParams,
            Self::BadParameter { .. } => MessageType::BadParameter,
            Self::PostDataInvalid(_) => MessageType::PostDataInvalid,
            Self::BadFloatData { .. } => MessageType::BadFloatData,
            Self::WrongReference { .. } => MessageType::WrongReference,
            Self::NotAuthorized => MessageType::NotAuthorized,
            Self::NotAuthenticated => MessageType::NotAuthenticated,
            Self::DoesNotExist => MessageType::DoesNotExist,
            Self::InvalidObjectType(_) => MessageType::InvalidObjType,
            Self::InvalidTransition { .. } => MessageType::InvalidTransition,
            Self::InvalidMethod => MessageType::InvalidMethod,
            Self::Store(_) => MessageType::ServerError,
        }
    }

    /// Structured detail payload for the response body, if any.
    ///
    /// Store failures never expose their internals.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::DataParsing(d) | Self::WrongParams(d) | Self::PostDataInvalid(d) => {
                Some(json!(d))
            }
            Self::BadParameter { field, details } | Self::BadFloatData { field, details } => {
                Some(json!({ field.as_str(): details }))
            }
            Self::WrongReference { field, target } => Some(json!({ field.as_str(): target })),
            Self::InvalidObjectType(name) => Some(json!(name)),
            Self::InvalidTransition { from, to } => {
                Some(json!({ "from": from.as_str(), "to": to.as_str() }))
            }
            _ => None,
        }
    }
}

impl From<StoreError> for RestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::DoesNotExist,
            StoreError::InvalidTransition { from, to, .. } => Self::InvalidTransition { from, to },
            StoreError::Invalid(details) => Self::WrongParams(details),
            other => Self::Store(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RestError>;
