//! Error types for otter-storage
//!
//! Consistency errors mean a channel's index can no longer be trusted and the
//! channel must stop. Running out of time budget is never an error.

use thiserror::Error;

use crate::object::{ObjectId, TypeId};

/// Errors raised by the entity cache and mark monitor
#[derive(Error, Debug)]
pub enum StorageError {
    /// An object id is already registered with a different type
    #[error("Type mismatch for object {object_id}: registered as {existing}, stored as {given}")]
    TypeMismatch {
        /// Object id
        object_id: ObjectId,
        /// Type the entity is registered with
        existing: TypeId,
        /// Type of the incoming record
        given: TypeId,
    },

    /// An object id was handed to a channel that does not own it
    #[error("Object {object_id} does not belong to channel {channel}")]
    WrongChannel {
        /// Object id
        object_id: ObjectId,
        /// Channel that received it
        channel: usize,
    },

    /// The null id or an otherwise improper id was stored
    #[error("Invalid object id {0}")]
    InvalidObjectId(ObjectId),

    /// A stored record with no bytes
    #[error("Zero length record for object {0}")]
    ZeroLength(ObjectId),

    /// `advance_marking` was asked to consume more than is pending
    #[error("Cannot advance marking by {amount}: {pending} marks pending")]
    MarkCountUnderflow {
        /// Requested amount
        amount: usize,
        /// Pending marks at the time of the call
        pending: usize,
    },

    /// A mark queue held ids when a sweep was issued
    #[error("Mark queue of channel {channel} still holds {length} ids")]
    MarkQueueNotEmpty {
        /// Channel of the queue
        channel: usize,
        /// Unprocessed entries
        length: usize,
    },

    /// The type dictionary does not know a type
    #[error("Unknown type id {0}")]
    UnknownType(TypeId),

    /// An entity needs its data loaded but has no storage location
    #[error("Object {0} has no storage location")]
    MissingLocation(ObjectId),

    /// The storage layer failed to load entity data
    #[error("Failed to load object {object_id}: {message}")]
    Load {
        /// Object id
        object_id: ObjectId,
        /// Failure reported by the storage layer
        message: String,
    },

    /// Rejected configuration value
    #[error("Invalid storage GC configuration: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    /// Create a load error
    pub fn load(object_id: ObjectId, message: impl Into<String>) -> Self {
        Self::Load {
            object_id,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the error indicates a corrupted index or broken mark accounting
    pub fn is_consistency_error(&self) -> bool {
        !matches!(self, Self::Load { .. } | Self::InvalidConfig(_))
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
