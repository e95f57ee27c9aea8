//! Return codes shared by all components.

/// The error kinds surfaced by the handle server, the read pipeline and the
/// state-machine control.
///
/// Operations that partially succeed do not report an error: a read that
/// collected some samples before failing reports the count collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    /// A nil argument, a bad size, an unknown or stale handle, or a
    /// forbidden flag combination.
    #[error("bad parameter")]
    BadParameter,
    /// An operation was attempted before its prerequisites were established,
    /// e.g. the handle server is not initialized.
    #[error("precondition not met")]
    PreconditionNotMet,
    /// The operation is not defined for this entity, e.g. a child deleting
    /// an explicit parent, or a read on a non-reader.
    #[error("illegal operation")]
    IllegalOperation,
    /// Deletion has already been requested and deferred; the entity is on
    /// its way out.
    #[error("already deleted")]
    AlreadyDeleted,
    /// The handle table is full or an allocation failed.
    #[error("out of resources")]
    OutOfResources,
    /// An intermediate state was observed; retry or treat as deferred.
    #[error("try again")]
    TryAgain,
    /// Catch-all, e.g. a deserialization failure.
    #[error("error")]
    Generic,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
