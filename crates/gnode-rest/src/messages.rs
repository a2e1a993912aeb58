//! Fixed catalog of response messages.
//!
//! Every JSON response names one entry by its `message_type` and carries the
//! matching human-readable `message`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ObjectSelected,
    NoObjectsFound,
    ObjectCreated,
    ObjectUpdated,
    Retrieved,
    Deleted,
    Processed,
    DataParsingError,
    WrongParams,
    BadParameter,
    PostDataInvalid,
    BadFloatData,
    WrongReference,
    NotAuthorized,
    NotAuthenticated,
    DoesNotExist,
    InvalidObjType,
    InvalidMethod,
    InvalidTransition,
    TooManyRequests,
    ServerError,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObjectSelected => "object_selected",
            Self::NoObjectsFound => "no_objects_found",
            Self::ObjectCreated => "object_created",
            Self::ObjectUpdated => "object_updated",
            Self::Retrieved => "retrieved",
            Self::Deleted => "deleted",
            Self::Processed => "processed",
            Self::DataParsingError => "data_parsing_error",
            Self::WrongParams => "wrong_params",
            Self::BadParameter => "bad_parameter",
            Self::PostDataInvalid => "post_data_invalid",
            Self::BadFloatData => "bad_float_data",
            Self::WrongReference => "wrong_reference",
            Self::NotAuthorized => "not_authorized",
            Self::NotAuthenticated => "not_authenticated",
            Self::DoesNotExist => "does_not_exist",
            Self::InvalidObjType => "invalid_obj_type",
            Self::InvalidMethod => "invalid_method",
            Self::InvalidTransition => "invalid_transition",
            Self::TooManyRequests => "too_many_requests",
            Self::ServerError => "server_error",
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::ObjectSelected => "Here is the list of requested objects.",
            Self::NoObjectsFound => "No objects found.",
            Self::ObjectCreated => "Object created successfully.",
            Self::ObjectUpdated => "Object updated successfully. Data changes saved.",
            Self::Retrieved => "Object retrieved successfully.",
            Self::Deleted => "Object was deleted.",
            Self::Processed => "Your request was processed successfully.",
            Self::DataParsingError => {
                "Data, sent in the request body, cannot be parsed. \
                 Please ensure, the data is sent in JSON format."
            }
            Self::WrongParams => {
                "Parameters provided are incorrect. Please consider details in the 'details' element."
            }
            Self::BadParameter => {
                "Some of the parameters provided are incorrect or object with a given ID does not exist."
            }
            Self::PostDataInvalid => "The structure of the POST data is invalid.",
            Self::BadFloatData => {
                "The data given is not a list of comma-separated float / integer values. \
                 Please check your input."
            }
            Self::WrongReference => "You may be referencing an object you don't have access to.",
            Self::NotAuthorized => "You don't have permissions to access the object.",
            Self::NotAuthenticated => "Please authenticate before sending the request.",
            Self::DoesNotExist => "Object does not exist.",
            Self::InvalidObjType => "You provided an invalid object type.",
            Self::InvalidMethod => "This URL does not support the method specified.",
            Self::InvalidTransition => "The object cannot move to the requested state.",
            Self::TooManyRequests => "Too many requests. Please slow down.",
            Self::ServerError => "Internal server error.",
        }
    }
}
