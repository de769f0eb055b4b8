use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("{0}")]
    Execution(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{source_name} returned status {status}")]
    Status { source_name: &'static str, status: u16 },

    #[error("could not decode {source_name} response: {message}")]
    Decode { source_name: &'static str, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} daily request limit exceeded")]
    DailyLimit(&'static str),
}

impl FetchError {
    /// Whether a later attempt may succeed. Drives the retry/fail split of
    /// ground-truth results.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(_) => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Decode { .. } | FetchError::NotFound(_) | FetchError::DailyLimit(_) => false,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ActionError {
    #[error("action '{action}' is missing required parameter '{param}'")]
    MissingParam {
        action: &'static str,
        param: &'static str,
    },

    #[error("invalid parameters for '{action}': {message}")]
    InvalidParams { action: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_and_server_faults_are_transient() {
        let status = |status| FetchError::Status { source_name: "stooq", status };
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(404).is_transient());
        assert!(!FetchError::NotFound("item 1".into()).is_transient());
        assert!(!FetchError::DailyLimit("stooq").is_transient());
        assert_eq!(
            ActionError::MissingParam { action: "goto", param: "url" }.to_string(),
            "action 'goto' is missing required parameter 'url'"
        );
    }
}
