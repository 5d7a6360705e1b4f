// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the Terrane control plane
//!
//! For HTTP-level error handling, see Dropshot.

use dropshot::HttpError;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// Error code reported when a referenced object does not exist.
pub const CODE_NOT_FOUND: &str = "NotFound";
/// Error code reported for malformed or invalid requests.
pub const CODE_BAD_REQUEST: &str = "BadRequest";
/// Error code reported for optimistic-concurrency and state conflicts.
pub const CODE_CONFLICT: &str = "Conflict";
/// Error code reported for unexpected internal failures.
pub const CODE_INTERNAL: &str = "Internal";
/// Error code recorded when an async operation exceeds its deadline.
pub const CODE_OPERATION_TIMED_OUT: &str = "OperationTimedOut";
/// Error code recorded when a render produces a cyclic dependency graph.
pub const CODE_DEPENDENCY_CYCLE: &str = "DependencyCycle";

/// An error that can be generated within a control-plane component
///
/// These may be generated while handling a client request or as part of a
/// background deployment.  When generated as part of an HTTP request, an
/// `Error` is converted into an HTTP error as one of the last steps in
/// processing the request, which keeps most of the system agnostic to the
/// transport with which it communicates with clients.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name}) not found: {id}")]
    ObjectNotFound { type_name: String, id: String },
    /// The request was well-formed, but the operation cannot be completed
    /// given the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// The specified input field is not valid.
    #[error("Invalid Value: {label}, {message}")]
    InvalidValue { label: String, message: String },
    /// The write raced another writer (version-tag mismatch) or the target
    /// resource is in a state that does not admit the operation.
    #[error("Conflict: {message}")]
    Conflict { message: String },
    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
}

impl Error {
    /// Generates an [`Error::ObjectNotFound`] error for the given resource
    /// type and identifier.
    pub fn not_found(type_name: &str, id: impl Display) -> Error {
        Error::ObjectNotFound {
            type_name: type_name.to_owned(),
            id: id.to_string(),
        }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due possibly to invalid client input
    /// or malformed requests.
    pub fn invalid_request(message: impl Display) -> Error {
        Error::InvalidRequest { message: message.to_string() }
    }

    /// Generates an [`Error::Conflict`] error with the specific message.
    pub fn conflict(message: impl Display) -> Error {
        Error::Conflict { message: message.to_string() }
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should
    /// not happen but that we cannot reasonably handle at runtime (e.g.,
    /// deserializing a record from the datastore).
    pub fn internal_error(internal_message: impl Display) -> Error {
        Error::InternalError { internal_message: internal_message.to_string() }
    }

    /// Returns the stable error code used for this error on the wire and in
    /// persisted operation-status records.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ObjectNotFound { .. } => CODE_NOT_FOUND,
            Error::InvalidRequest { .. } | Error::InvalidValue { .. } => {
                CODE_BAD_REQUEST
            }
            Error::Conflict { .. } => CODE_CONFLICT,
            Error::InternalError { .. } => CODE_INTERNAL,
        }
    }

    /// Given an [`Error`] with an internal message, return the same error
    /// with `context` prepended to it to provide more context.  Errors
    /// without an internal message are returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            other => other,
        }
    }
}

/// Structured `{code, message}` error detail carried in operation-status
/// records and error response bodies
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl ErrorDetails {
    pub fn new(code: &str, message: impl Display) -> ErrorDetails {
        ErrorDetails { code: code.to_owned(), message: message.to_string() }
    }
}

impl From<&Error> for ErrorDetails {
    /// Converts an `Error` into the detail persisted with an operation
    /// status.  Internal errors are normalized so that internal details
    /// never reach the wire format.
    fn from(error: &Error) -> ErrorDetails {
        let message = match error {
            Error::InternalError { .. } => {
                String::from("an internal error occurred")
            }
            other => other.to_string(),
        };
        ErrorDetails { code: error.code().to_owned(), message }
    }
}

impl From<Error> for HttpError {
    /// Converts an `Error` into an `HttpError`.  This defines how errors
    /// that are represented internally are ultimately exposed to clients
    /// over HTTP.
    fn from(error: Error) -> HttpError {
        match error {
            Error::ObjectNotFound { ref type_name, ref id } => {
                let message = format!("not found: {} \"{}\"", type_name, id);
                HttpError::for_client_error(
                    Some(String::from(CODE_NOT_FOUND)),
                    dropshot::ClientErrorStatusCode::NOT_FOUND,
                    message,
                )
            }

            Error::InvalidRequest { message } => HttpError::for_bad_request(
                Some(String::from(CODE_BAD_REQUEST)),
                message,
            ),

            Error::InvalidValue { label, message } => {
                let message =
                    format!("unsupported value for \"{}\": {}", label, message);
                HttpError::for_bad_request(
                    Some(String::from(CODE_BAD_REQUEST)),
                    message,
                )
            }

            Error::Conflict { message } => HttpError::for_client_error(
                Some(String::from(CODE_CONFLICT)),
                dropshot::ClientErrorStatusCode::CONFLICT,
                message,
            ),

            Error::InternalError { internal_message } => {
                HttpError::for_internal_error(internal_message)
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::internal_error(e.to_string())
    }
}
