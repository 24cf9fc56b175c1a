//! Error types surfaced by the API client and the bulk notifier.

use thiserror::Error;

use crate::notifier::RunReport;

/// Status used when the provider reports an error without one.
pub const DEFAULT_API_STATUS: u16 = 422;

/// Status of a query that names no recognizable location.
pub const PARAMETER_STATUS: u16 = 406;

const DEFAULT_KIND: &str = "api error";
const PARAMETER_DESCRIPTION: &str = "incorrect location parameters passed for query";

#[derive(Error, Debug)]
pub enum ApiError {
    /// Non-200 response, or a 200 whose payload carries `response.error`.
    #[error("{status}: {description}")]
    Api {
        kind: String,
        description: String,
        status: u16,
    },

    /// None of the location variants in the query could be resolved.
    #[error("406: incorrect location parameters passed for query")]
    Parameter,

    #[error("422: request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("422: invalid JSON payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// Transport-level failure: the server answered with a non-200 status.
    pub fn transport(status: u16, reason: impl Into<String>) -> Self {
        Self::Api {
            kind: DEFAULT_KIND.to_string(),
            description: reason.into(),
            status,
        }
    }

    /// Application-level failure embedded in a 200 payload.
    pub fn application(
        kind: Option<String>,
        description: Option<String>,
        status: Option<u16>,
    ) -> Self {
        Self::Api {
            kind: kind.unwrap_or_else(|| DEFAULT_KIND.to_string()),
            description: description
                .unwrap_or_else(|| "an error has occured while processing".to_string()),
            status: status.unwrap_or(DEFAULT_API_STATUS),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Api { status, .. } => *status,
            Self::Parameter => PARAMETER_STATUS,
            Self::Http(_) | Self::Decode(_) | Self::Config(_) => DEFAULT_API_STATUS,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Api { kind, .. } => kind,
            Self::Parameter => "parameter error",
            Self::Http(_) => "http error",
            Self::Decode(_) => "decode error",
            Self::Config(_) => "config error",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Api { description, .. } => description.clone(),
            Self::Parameter => PARAMETER_DESCRIPTION.to_string(),
            Self::Http(e) => e.to_string(),
            Self::Decode(e) => e.to_string(),
            Self::Config(msg) => msg.clone(),
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self, Self::Parameter)
    }
}

/// Failures of the collaborators the notifier talks to.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("weather lookup failed for {location}: {source}")]
    Api {
        location: String,
        #[source]
        source: ApiError,
    },

    #[error("subscriber store error: {0}")]
    Store(String),

    #[error("mail dispatch error: {0}")]
    Mail(String),

    #[error("template error: {0}")]
    Render(String),

    /// The run stopped early; `report` holds what was done before the failure.
    #[error("run aborted after {} emails: {source}", .report.sent)]
    Aborted {
        report: RunReport,
        #[source]
        source: Box<NotifyError>,
    },
}

impl NotifyError {
    /// Partial report, when the run got far enough to produce one.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Aborted { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_keeps_reason_and_status() {
        let err = ApiError::transport(500, "Internal Server Error");
        assert_eq!(err.status(), 500);
        assert_eq!(err.description(), "Internal Server Error");
        assert_eq!(err.kind(), "api error");
        assert_eq!(err.to_string(), "500: Internal Server Error");
    }

    #[test]
    fn application_error_defaults_to_422() {
        let err = ApiError::application(Some("querynotfound".into()), None, None);
        assert_eq!(err.status(), 422);
        assert_eq!(err.kind(), "querynotfound");
        assert!(err.description().contains("error has occured"));
    }

    #[test]
    fn parameter_error_is_406() {
        let err = ApiError::Parameter;
        assert_eq!(err.status(), 406);
        assert!(err.is_parameter());
        assert!(err.to_string().starts_with("406: incorrect location"));
    }

    #[test]
    fn aborted_exposes_partial_report() {
        let report = RunReport {
            sent: 3,
            ..RunReport::default()
        };
        let err = NotifyError::Aborted {
            report,
            source: Box::new(NotifyError::Mail("smtp down".into())),
        };
        assert_eq!(err.report().map(|r| r.sent), Some(3));
        assert!(err.to_string().contains("after 3 emails"));
    }
}
