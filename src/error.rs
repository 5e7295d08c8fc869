//! replicactl Error Types

use thiserror::Error;

/// Result type alias for replicactl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure classes, used to pick an exit code and decide whether a
/// multi-node loop may skip a node or must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input or a missing argument combination. Nothing was changed.
    UserInput,
    /// A node could not be reached or refused the bind.
    Connectivity,
    /// The operation would break a topology or range invariant.
    Consistency,
    /// An entry the operation depends on does not exist.
    NotFound,
    /// The operator declined a confirmation prompt.
    Aborted,
    /// Anything else reported by the directory or the local system.
    Internal,
}

/// replicactl error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // User input errors
    #[error("{0}")]
    InvalidRange(String),

    #[error("Replica ID must be an integer: {0}")]
    InvalidReplicaId(String),

    #[error("{0}")]
    MissingArguments(String),

    #[error("{0}")]
    InsufficientPrivilege(String),

    #[error("Unknown host {host}: {reason}")]
    UnknownHost { host: String, reason: String },

    // Connectivity errors
    #[error("Failed to connect to server {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Failed to bind to {host}: {reason}")]
    BindFailed { host: String, reason: String },

    #[error("Operation on {host} timed out")]
    OperationTimeout { host: String },

    // Directory errors
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Directory error on {host}: {message}")]
    Directory { host: String, message: String },

    #[error("No RUV records found.")]
    NoRuvsFound,

    #[error("Replica ID {0} not found")]
    ReplicaIdNotFound(u16),

    // Consistency errors
    #[error("'{node}' has no replication agreement for '{remote}'")]
    NoAgreement { node: String, remote: String },

    #[error("{0}")]
    DuplicateAgreement(String),

    #[error("Cannot remove the last replication link of '{host}'\nPlease use the 'del' command to remove it from the domain")]
    LastAgreement { host: String },

    #[error("Deleting this server will orphan '{0}'.\nYou will need to reconfigure your replication topology to delete this server.")]
    WouldOrphan(String),

    #[error("Deleting this server is not allowed as it would leave your installation without a CA.")]
    LastCaProvider,

    #[error("Replica is active DNSSEC key master. Uninstall could break your DNS system.\nPlease disable or replace DNSSEC key master first.")]
    DnssecKeyMaster,

    #[error("New range overlaps the {kind} on {host}")]
    RangeOverlap { host: String, kind: &'static str },

    #[error("New range does not fit within existing IPA ranges. See ipa help idrange command")]
    RangeOutsideDomain,

    #[error("New range overlaps with a Trust range. See ipa help idrange command")]
    RangeOverlapsTrust,

    #[error("{0}")]
    ZombieHost(String),

    #[error("Connection to '{host}' failed: {reason}\nUnable to delete replica '{host}'")]
    ReplicaUnreachable { host: String, reason: String },

    #[error("Unable to remove agreement on {host}: {reason}")]
    AgreementRemoval { host: String, reason: String },

    #[error("Can't remove itself: {0}")]
    SelfRemoval(String),

    #[error("{0} is deprecated with managed IPA replication topology. Please use `ipa topologysegment-*` commands to manage the topology.")]
    ManagedTopology(&'static str),

    // Certificate errors
    #[error("Could not load the required CA certificate file [{path}]: {reason}")]
    Certificate { path: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Aborted")]
    Aborted,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_)
            | Error::ConfigParse(_)
            | Error::InvalidRange(_)
            | Error::InvalidReplicaId(_)
            | Error::MissingArguments(_)
            | Error::InsufficientPrivilege(_)
            | Error::UnknownHost { .. }
            | Error::Certificate { .. } => ErrorClass::UserInput,

            Error::ConnectionFailed { .. }
            | Error::BindFailed { .. }
            | Error::OperationTimeout { .. }
            | Error::ReplicaUnreachable { .. } => ErrorClass::Connectivity,

            Error::NoAgreement { .. }
            | Error::DuplicateAgreement(_)
            | Error::LastAgreement { .. }
            | Error::WouldOrphan(_)
            | Error::LastCaProvider
            | Error::DnssecKeyMaster
            | Error::RangeOverlap { .. }
            | Error::RangeOutsideDomain
            | Error::RangeOverlapsTrust
            | Error::ZombieHost(_)
            | Error::SelfRemoval(_)
            | Error::ManagedTopology(_) => ErrorClass::Consistency,

            Error::NotFound(_) | Error::NoRuvsFound | Error::ReplicaIdNotFound(_) => {
                ErrorClass::NotFound
            }

            Error::Aborted => ErrorClass::Aborted,

            Error::AlreadyExists(_)
            | Error::Directory { .. }
            | Error::AgreementRemoval { .. }
            | Error::Io(_)
            | Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Check if this error means the node could not be reached
    pub fn is_connectivity(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }

    /// Check if this error means an entry is missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Process exit code for this error. An empty update vector is not a
    /// failure, there is just nothing to act on.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::NoRuvsFound => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = Error::ConnectionFailed {
            host: "a.example.com".into(),
            reason: "refused".into(),
        };
        assert!(err.is_connectivity());
        assert_eq!(err.exit_code(), 1);

        assert_eq!(
            Error::RangeOverlap { host: "b".into(), kind: "DNA range" }.class(),
            ErrorClass::Consistency
        );
        assert_eq!(Error::InvalidRange("Invalid range".into()).class(), ErrorClass::UserInput);
        assert_eq!(Error::Aborted.class(), ErrorClass::Aborted);
        assert!(Error::NotFound("cn=x".into()).is_not_found());
        assert_eq!(Error::NoRuvsFound.exit_code(), 0);
    }

    #[test]
    fn test_last_agreement_message_points_to_del() {
        let msg = Error::LastAgreement { host: "b.example.com".into() }.to_string();
        assert!(msg.contains("last replication link of 'b.example.com'"));
        assert!(msg.contains("'del' command"));
    }
}
