use serde::{Deserialize, Serialize};

/// A request to invoke a named capability provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON parameters passed to the tool.
    pub params: serde_json::Value,
}

impl ToolCall {
    /// Creates a new tool call.
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Failure of an external tool invocation.
///
/// Transient failures are retried within an iteration; permanent failures end
/// the current iteration and are remembered in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum ToolError {
    /// Network failure, rate limit, timeout: worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Permission denied, not found, bad request: retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ToolError {
    /// Whether the error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }

    /// The error message without its classification.
    pub fn message(&self) -> &str {
        match self {
            ToolError::Transient(m) | ToolError::Permanent(m) => m,
        }
    }

    /// Classify a raw provider error message.
    ///
    /// Rate limits (429), timeouts, and server errors (5xx) are transient.
    /// Everything else, including 400/401/403/404, is permanent.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        // Non-retryable patterns checked first
        if lower.contains("400")
            || lower.contains("401")
            || lower.contains("403")
            || lower.contains("404")
            || lower.contains("permission denied")
            || lower.contains("not found")
        {
            return ToolError::Permanent(message);
        }

        let transient = lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504");

        if transient {
            ToolError::Transient(message)
        } else {
            ToolError::Permanent(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient() {
        assert!(ToolError::classify("HTTP 429 Too Many Requests").is_transient());
        assert!(ToolError::classify("upstream 503").is_transient());
        assert!(ToolError::classify("request timed out").is_transient());
    }

    #[test]
    fn test_classify_permanent() {
        assert!(!ToolError::classify("permission denied for calendar").is_transient());
        assert!(!ToolError::classify("404 not found").is_transient());
        assert!(!ToolError::classify("unsupported locale").is_transient());
    }

    #[test]
    fn test_tool_error_serialization() {
        let err = ToolError::Transient("rate limited".into());
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("transient"));
        let parsed: ToolError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
        assert_eq!(parsed.message(), "rate limited");
    }
}
