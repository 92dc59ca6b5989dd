/*!
 * Error handling facilities for the block control plane
 *
 * For HTTP-level error handling, see Dropshot.
 */

use dropshot::HttpError;
use http::StatusCode;

/**
 * An error that can be generated within a control plane component
 *
 * These may be generated while handling a client request or as part of a
 * pod-event reconciliation pass.  When generated as part of an HTTP request,
 * an `ApiError` is converted into an HTTP error as one of the last steps in
 * processing the request so that most of the system remains agnostic to the
 * transport with which the system communicates with clients.
 *
 * Each variant corresponds to one wire-visible error kind.  The kind string
 * (see [`ApiError::kind`]) and HTTP status are the stable interface; the
 * detail message is free-form and, for engine command failures, carries the
 * verbatim stderr of the failed command.
 */
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /*
     * Not-found family (404)
     */
    #[error("no block found matching {lookup}")]
    BlockNotFound { lookup: String },
    #[error("no replica {replica} in block {block}")]
    ReplicaNotFound { block: String, replica: String },
    #[error("no node found with name \"{node}\"")]
    NodeNotFound { node: String },
    #[error("no disk found: {detail}")]
    DiskNotFound { detail: String },
    #[error("no storage available on node \"{node}\"")]
    NodeStorageNotFound { node: String },
    #[error("no pod found with name \"{pod}\"")]
    PodNotFound { pod: String },
    #[error("block {block} has no controller pod")]
    ControllerNotFound { block: String },

    /*
     * Conflict family (409)
     */
    #[error("a block named \"{name}\" already exists")]
    BlockExists { name: String },
    #[error("block {block} is mounted")]
    BlockMounted { block: String },
    #[error("block {block} is not mounted")]
    BlockNotMounted { block: String },
    #[error("block {block} is already formatted")]
    BlockFormatted { block: String },
    #[error("block {block} is not formatted")]
    BlockNotFormatted { block: String },
    #[error("block {block} already has a controller")]
    ControllerExists { block: String },
    #[error("controller of block {block} is mounted")]
    ControllerMounted { block: String },

    /*
     * Bad-request family (400)
     */
    #[error("block {block} is offline")]
    BlockOffline { block: String },
    #[error("unsupported value for \"{label}\": {message}")]
    InvalidValue { label: String, message: String },
    #[error("cannot remove the last replica of block {block} without force")]
    LastReplica { block: String },

    /*
     * Precondition family: operations that require substrate state the
     * control plane believed to be present.  Surfaced as server errors.
     */
    #[error("block {block} has no controller")]
    NoController { block: String },
    #[error("pod \"{pod}\" is not running")]
    PodNotRunning { pod: String },
    #[error("replica {replica} has no endpoint")]
    NoReplicaEndpoint { replica: String },

    /*
     * Upstream family (500): failures reported by the orchestrator or the
     * engine itself.
     */
    #[error("pod creation failed: {detail}")]
    PodCreationError { detail: String },
    #[error("add-replica failed: {detail}")]
    AddReplicaError { detail: String },
    #[error("cannot remove last replica: {detail}")]
    CannotRemoveLastReplica { detail: String },
    #[error("engine command failed: {detail}")]
    EngineCommandFailed { detail: String },

    /** an operational condition that should not happen */
    #[error("internal error: {detail}")]
    InternalError { detail: String },
}

impl ApiError {
    /**
     * Returns the stable kind string surfaced to clients as the error code.
     */
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BlockNotFound { .. } => "BlockNotFound",
            ApiError::ReplicaNotFound { .. } => "ReplicaNotFound",
            ApiError::NodeNotFound { .. } => "NodeNotFound",
            ApiError::DiskNotFound { .. } => "DiskNotFound",
            ApiError::NodeStorageNotFound { .. } => "NodeStorageNotFound",
            ApiError::PodNotFound { .. } => "PodNotFound",
            ApiError::ControllerNotFound { .. } => "ControllerNotFound",
            ApiError::BlockExists { .. } => "BlockExists",
            ApiError::BlockMounted { .. } => "BlockMounted",
            ApiError::BlockNotMounted { .. } => "BlockNotMounted",
            ApiError::BlockFormatted { .. } => "BlockFormatted",
            ApiError::BlockNotFormatted { .. } => "BlockNotFormatted",
            ApiError::ControllerExists { .. } => "ControllerExists",
            ApiError::ControllerMounted { .. } => "ControllerMounted",
            ApiError::BlockOffline { .. } => "BlockOffline",
            ApiError::InvalidValue { .. } => "InvalidValue",
            ApiError::LastReplica { .. } => "LastReplica",
            ApiError::NoController { .. } => "NoController",
            ApiError::PodNotRunning { .. } => "PodNotRunning",
            ApiError::NoReplicaEndpoint { .. } => "NoReplicaEndpoint",
            ApiError::PodCreationError { .. } => "PodCreationError",
            ApiError::AddReplicaError { .. } => "AddReplicaError",
            ApiError::CannotRemoveLastReplica { .. } => {
                "CannotRemoveLastReplica"
            }
            ApiError::EngineCommandFailed { .. } => "EngineCommandFailed",
            ApiError::InternalError { .. } => "InternalError",
        }
    }

    /** Returns the HTTP status with which this error is surfaced. */
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BlockNotFound { .. }
            | ApiError::ReplicaNotFound { .. }
            | ApiError::NodeNotFound { .. }
            | ApiError::DiskNotFound { .. }
            | ApiError::NodeStorageNotFound { .. }
            | ApiError::PodNotFound { .. }
            | ApiError::ControllerNotFound { .. } => StatusCode::NOT_FOUND,

            ApiError::BlockExists { .. }
            | ApiError::BlockMounted { .. }
            | ApiError::BlockNotMounted { .. }
            | ApiError::BlockFormatted { .. }
            | ApiError::BlockNotFormatted { .. }
            | ApiError::ControllerExists { .. }
            | ApiError::ControllerMounted { .. } => StatusCode::CONFLICT,

            ApiError::BlockOffline { .. }
            | ApiError::InvalidValue { .. }
            | ApiError::LastReplica { .. } => StatusCode::BAD_REQUEST,

            ApiError::NoController { .. }
            | ApiError::PodNotRunning { .. }
            | ApiError::NoReplicaEndpoint { .. }
            | ApiError::PodCreationError { .. }
            | ApiError::AddReplicaError { .. }
            | ApiError::CannotRemoveLastReplica { .. }
            | ApiError::EngineCommandFailed { .. }
            | ApiError::InternalError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /**
     * Generates an [`ApiError::InvalidValue`] for the named parameter.
     */
    pub fn invalid_value(label: &str, message: &str) -> ApiError {
        ApiError::InvalidValue {
            label: label.to_owned(),
            message: message.to_owned(),
        }
    }

    /**
     * Generates an [`ApiError::InternalError`] with the given message.
     *
     * This is used for operational conditions that should not happen but
     * that we cannot reasonably handle at runtime (e.g., a block entity
     * whose mount point vanished from under it).
     */
    pub fn internal_error(detail: &str) -> ApiError {
        ApiError::InternalError { detail: detail.to_owned() }
    }
}

impl From<ApiError> for HttpError {
    /**
     * Converts an `ApiError` into an `HttpError`.  This defines how errors
     * that are represented internally are ultimately exposed to clients over
     * HTTP: the kind becomes the error code, the display form becomes the
     * message.
     */
    fn from(error: ApiError) -> HttpError {
        let status_code = error.status_code();
        let message = error.to_string();
        HttpError {
            status_code,
            error_code: Some(String::from(error.kind())),
            external_message: message.clone(),
            internal_message: message,
        }
    }
}

#[cfg(test)]
mod test {
    use super::ApiError;
    use dropshot::HttpError;
    use http::StatusCode;

    #[test]
    fn test_error_kinds_and_status() {
        let cases: Vec<(ApiError, &str, StatusCode)> = vec![
            (
                ApiError::BlockNotFound { lookup: "b1".to_string() },
                "BlockNotFound",
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::BlockMounted { block: "b1".to_string() },
                "BlockMounted",
                StatusCode::CONFLICT,
            ),
            (
                ApiError::BlockOffline { block: "b1".to_string() },
                "BlockOffline",
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::NoController { block: "b1".to_string() },
                "NoController",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::AddReplicaError {
                    detail: "Error running add replica command".to_string(),
                },
                "AddReplicaError",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, kind, status) in cases {
            assert_eq!(error.kind(), kind);
            assert_eq!(error.status_code(), status);
            let http_error = HttpError::from(error);
            assert_eq!(http_error.status_code, status);
            assert_eq!(http_error.error_code, Some(kind.to_string()));
        }
    }

    #[test]
    fn test_error_detail_carries_stderr() {
        let stderr = "cannot remove last replica if volume is up";
        let error = ApiError::CannotRemoveLastReplica {
            detail: stderr.to_string(),
        };
        assert!(error.to_string().contains(stderr));
    }
}
