//! Error types for pipeline verification
//!
//! Every error is fatal to a scenario run. Variants carry structured context
//! (stage, HTTP status, last observed state) so a failure can be localized,
//! and [`Error::remediation`] pairs each one with the next place to look.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The four steps of registering a test resource with the registry API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStage {
    /// Resolving the source type and application type ids by name
    LookupTypes,
    /// `POST sources`
    CreateSource,
    /// `POST authentications`
    CreateAuthentication,
    /// `POST applications`
    CreateApplication,
}

impl RegistrationStage {
    /// One-based step number, as reported in diagnostics
    pub fn number(self) -> u8 {
        match self {
            RegistrationStage::LookupTypes => 1,
            RegistrationStage::CreateSource => 2,
            RegistrationStage::CreateAuthentication => 3,
            RegistrationStage::CreateApplication => 4,
        }
    }

    /// Short name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStage::LookupTypes => "lookup-types",
            RegistrationStage::CreateSource => "create-source",
            RegistrationStage::CreateAuthentication => "create-authentication",
            RegistrationStage::CreateApplication => "create-application",
        }
    }
}

impl fmt::Display for RegistrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.number(), self.as_str())
    }
}

/// Polling stages run against the relational store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Manifest creation and per-file processing
    Manifest,
    /// Aggregated summary rows
    Summary,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Manifest => write!(f, "manifest processing"),
            PipelineStage::Summary => write!(f, "summary population"),
        }
    }
}

/// How far a timed-out stage got before its budget ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing was ever observed for the correlation key
    NeverStarted,
    /// Something was observed but it never reached a terminal state
    Incomplete,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::NeverStarted => write!(f, "never started"),
            Progress::Incomplete => write!(f, "started but incomplete"),
        }
    }
}

/// Why the optimization engine check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsenceReason {
    /// No experiment exists: the payload never reached the engine
    NoExperiment,
    /// Experiments exist but produced no recommendation: not enough data
    NoRecommendation,
}

impl fmt::Display for AbsenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbsenceReason::NoExperiment => write!(f, "no-experiment"),
            AbsenceReason::NoRecommendation => write!(f, "no-recommendation"),
        }
    }
}

/// Main error type for pipecheck operations
#[derive(Debug, Error)]
pub enum Error {
    /// Token issuance failed
    #[error("authentication failed against {issuer}: {message}")]
    Auth {
        /// Issuer URL the token was requested from
        issuer: String,
        /// Issuer response with secrets redacted
        message: String,
    },

    /// One of the registry calls failed or returned an unexpected shape
    #[error("registration failed at {stage}: {message}")]
    Registration {
        /// Step that failed
        stage: RegistrationStage,
        /// Description of what failed
        message: String,
    },

    /// The registry accepted the resource but no provider record appeared
    #[error("registration for {correlation_key} did not propagate within {waited:?}")]
    RegistrationTimeout {
        /// Correlation key of the registered resource
        correlation_key: String,
        /// How long propagation was awaited
        waited: Duration,
    },

    /// The ingestion gateway rejected the payload
    #[error("upload rejected with HTTP {status}: {message}")]
    Upload {
        /// HTTP status returned by the gateway
        status: u16,
        /// Response body, truncated
        message: String,
    },

    /// A polling stage exhausted its budget
    #[error("{stage} timed out after {waited:?} ({progress}): {last_observed}")]
    PipelineTimeout {
        /// Stage that timed out
        stage: PipelineStage,
        /// Whether anything was ever observed
        progress: Progress,
        /// Human-readable last observed state
        last_observed: String,
        /// Budget that was exhausted
        waited: Duration,
    },

    /// The pipeline reported a terminal failure (e.g. a report file failed)
    #[error("{stage} failed for {correlation_key}: {detail}")]
    ProcessingFailed {
        /// Stage that observed the failure
        stage: PipelineStage,
        /// Correlation key being verified
        correlation_key: String,
        /// What failed
        detail: String,
    },

    /// The optimization engine produced no artifacts within budget
    #[error("recommendation absent ({reason}) for {correlation_key} after {attempts} attempts")]
    RecommendationAbsent {
        /// Which artifact was missing
        reason: AbsenceReason,
        /// Correlation key being verified
        correlation_key: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// A store returned a record tied to a different correlation key
    #[error("correlation key mismatch from {origin}: expected {expected}, found {found}")]
    CorrelationMismatch {
        /// Which query returned the record
        origin: String,
        /// Key the scenario uploaded
        expected: String,
        /// Key the record carried
        found: String,
    },

    /// The run was interrupted
    #[error("cancelled during {stage}")]
    Cancelled {
        /// Stage in flight when the interrupt arrived
        stage: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Transport-level HTTP failure (connect, timeout, undecodable body)
    #[error("http error [{context}]: {message}")]
    Http {
        /// Operation that issued the request
        context: String,
        /// Description of what failed
        message: String,
        /// Whether a repeat could succeed
        retryable: bool,
    },

    /// A store query could not be executed or parsed
    #[error("store query failed [{store}]: {message}")]
    Store {
        /// Store that was queried
        store: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid or incomplete configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Local filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an authentication error
    pub fn auth(issuer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            issuer: issuer.into(),
            message: message.into(),
        }
    }

    /// Create a registration error for the given step
    pub fn registration(stage: RegistrationStage, message: impl Into<String>) -> Self {
        Self::Registration {
            stage,
            message: message.into(),
        }
    }

    /// Create an upload error from a gateway status
    pub fn upload(status: u16, message: impl Into<String>) -> Self {
        Self::Upload {
            status,
            message: message.into(),
        }
    }

    /// Create a cancellation error for the given stage
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
        }
    }

    /// Create a store error
    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an HTTP error from a reqwest failure
    ///
    /// Connect failures and timeouts are retryable; everything else is not.
    pub fn http(context: impl Into<String>, err: &reqwest::Error) -> Self {
        Self::Http {
            context: context.into(),
            message: err.to_string(),
            retryable: err.is_timeout() || err.is_connect(),
        }
    }

    /// Create an HTTP error from an unexpected response status
    ///
    /// Server errors are retryable; client errors are not.
    pub fn http_status(context: impl Into<String>, status: u16, body: &str) -> Self {
        Self::Http {
            context: context.into(),
            message: format!("HTTP {}: {}", status, body),
            retryable: status >= 500,
        }
    }

    /// Create a non-retryable HTTP error (e.g. an undecodable response)
    pub fn http_permanent(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Http {
            context: context.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Only transport and store failures are. Taxonomy errors are final by
    /// definition: a repeat with the same inputs fails identically.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Http { retryable, .. } => *retryable,
            Error::Store { .. } => true,
            _ => false,
        }
    }

    /// Check if this error came from a user interrupt
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Check if this failure indicates thin data rather than a broken pipeline
    pub fn is_data_density_issue(&self) -> bool {
        matches!(
            self,
            Error::RecommendationAbsent {
                reason: AbsenceReason::NoRecommendation,
                ..
            }
        )
    }

    /// Short category label used in verdict reports
    pub fn category(&self) -> &'static str {
        match self {
            Error::Auth { .. } => "AuthError",
            Error::Registration { .. } => "RegistrationError",
            Error::RegistrationTimeout { .. } => "RegistrationTimeoutError",
            Error::Upload { .. } => "UploadError",
            Error::PipelineTimeout { .. } => "PipelineTimeoutError",
            Error::ProcessingFailed { .. } => "ProcessingFailedError",
            Error::RecommendationAbsent { .. } => "RecommendationAbsentError",
            Error::CorrelationMismatch { .. } => "CorrelationMismatchError",
            Error::Cancelled { .. } => "Cancelled",
            Error::Kube { .. } => "KubeError",
            Error::Http { .. } => "HttpError",
            Error::Store { .. } => "StoreError",
            Error::Config { .. } => "ConfigError",
            Error::Io(_) => "IoError",
        }
    }

    /// Targeted guidance for the operator
    pub fn remediation(&self) -> String {
        match self {
            Error::Auth { issuer, .. } => format!(
                "Verify the OAuth client id and secret and that {issuer} is reachable. \
                 Inspect the retained token-fetch log for the issuer response."
            ),
            Error::Registration { stage, .. } => match stage {
                RegistrationStage::LookupTypes => "The source or application type was not found. \
                     Confirm the registry has been seeded with its type catalog."
                    .to_string(),
                RegistrationStage::CreateSource => "POST sources was rejected. Check the registry \
                     API logs; a source with the same name or source_ref may already exist."
                    .to_string(),
                RegistrationStage::CreateAuthentication => "POST authentications was rejected. \
                     The source was created and will be deleted by cleanup; check the \
                     registry API logs for the authentication payload."
                    .to_string(),
                RegistrationStage::CreateApplication => "POST applications was rejected. Check \
                     that the application type is compatible with the source type and that \
                     the extra configuration is accepted."
                    .to_string(),
            },
            Error::RegistrationTimeout { .. } => "The registry accepted the resource but the \
                 ingestion service never created a provider for it. Check the registration \
                 queue consumer logs and the provider table in the relational store."
                .to_string(),
            Error::Upload { status, .. } => match status {
                401 => "The gateway rejected the bearer token. Check that the gateway trusts \
                     the configured issuer and that the token has not expired."
                    .to_string(),
                403 => "The gateway rejected the payload by policy. Check the content type \
                     and the org entitlements of the service account."
                    .to_string(),
                _ => "Inspect the gateway logs for the upload request id.".to_string(),
            },
            Error::PipelineTimeout {
                stage, progress, ..
            } => match (stage, progress) {
                (PipelineStage::Manifest, Progress::NeverStarted) => "The gateway accepted the \
                     upload but no manifest was recorded. Check that the ingestion listener \
                     consumed the upload message (queue lag, listener logs)."
                    .to_string(),
                (PipelineStage::Manifest, Progress::Incomplete) => "The manifest exists but \
                     files are still pending. Check the processing worker logs and the \
                     report status table."
                    .to_string(),
                (PipelineStage::Summary, Progress::NeverStarted) => "Processing completed but \
                     no summary rows were written. Check the summary task queue and worker logs."
                    .to_string(),
                (PipelineStage::Summary, Progress::Incomplete) => "Summary rows exist but are \
                     still empty. Check the summary worker for long-running aggregation."
                    .to_string(),
            },
            Error::ProcessingFailed { .. } => "A report file failed processing. Query the \
                 report status table for the failed file and inspect the worker logs."
                .to_string(),
            Error::RecommendationAbsent { reason, .. } => match reason {
                AbsenceReason::NoExperiment => "The payload never reached the optimization \
                     engine. Check that its processor consumed the upload event and query \
                     the experiment table."
                    .to_string(),
                AbsenceReason::NoRecommendation => "Experiments exist but no recommendation \
                     was produced. This points to insufficient data density rather than a \
                     broken pipeline: upload more intervals or extend the budget."
                    .to_string(),
            },
            Error::CorrelationMismatch { origin, .. } => format!(
                "{origin} returned a record for another key. Check for stale data from an \
                 earlier run sharing the store."
            ),
            Error::Cancelled { .. } => {
                "The run was interrupted. Resources and diagnostics were cleaned up.".to_string()
            }
            Error::Kube { .. } => "Check the kubeconfig context and RBAC for secrets, routes, \
                 pods and pods/exec in the target namespaces."
                .to_string(),
            Error::Http { context, .. } => format!(
                "Check that the endpoint used by {context} is reachable and responds within \
                 the per-call timeout."
            ),
            Error::Store { store, .. } => format!(
                "Check that the {store} database pod is running and that psql can connect \
                 with the configured user and database."
            ),
            Error::Config { .. } => "Fix the configuration file or flags and rerun.".to_string(),
            Error::Io(_) => {
                "Check permissions on the diagnostics and temp directories.".to_string()
            }
        }
    }
}
