//! Failure-reason humanizer.
//!
//! Maps raw provider/tool error text onto short, user-readable hints for
//! the final result blob and the CLI status view. Raw `evolution_flags`
//! stay available through the gateway for operators.

/// Translate a classified failure reason into a human-readable hint.
pub fn humanize_failure(reason: &str) -> String {
    let lower = reason.to_lowercase();

    let hint = if lower.contains("budget") {
        "Budget limit reached; raise it in config/budget.json or via the API"
    } else if lower.contains("401") || lower.contains("unauthorized") || lower.contains("invalid api key")
    {
        "API key invalid or expired"
    } else if lower.contains("403") || lower.contains("forbidden") {
        "Access denied by the provider"
    } else if lower.contains("429") || lower.contains("rate limit") {
        "Provider rate limit hit; retries exhausted"
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "Request timed out"
    } else if lower.contains("connection") || lower.contains("connect error") || lower.contains("dns")
    {
        "Could not reach the provider"
    } else if lower.contains("cancelled") || lower.contains("canceled") {
        "Cancelled by the user"
    } else if lower.contains("context length") || lower.contains("too many tokens") {
        "Prompt exceeded the model's context window"
    } else {
        return format!("Task failed: {reason}");
    };
    format!("{hint} ({reason})")
}

/// Render a failed task's flags into a single hint line, preferring the
/// most recent `failed:` tag.
pub fn failure_hint_from_flags(flags: &[String]) -> Option<String> {
    flags
        .iter()
        .rev()
        .find_map(|f| f.strip_prefix("failed:"))
        .map(humanize_failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_failures_get_hints() {
        assert!(humanize_failure("HTTP 401 from provider").contains("API key"));
        assert!(humanize_failure("rate limit exceeded (429)").contains("rate limit"));
        assert!(humanize_failure("request timed out after 60s").contains("timed out"));
        assert!(humanize_failure("budget exceeded: $1.2 >= $1.0").contains("Budget"));
    }

    #[test]
    fn test_unknown_failure_passes_through() {
        let hint = humanize_failure("exotic explosion");
        assert!(hint.contains("exotic explosion"));
    }

    #[test]
    fn test_hint_from_flags_uses_latest() {
        let flags = vec![
            "timeout_recovered:claimed".to_string(),
            "failed:connection refused".to_string(),
        ];
        let hint = failure_hint_from_flags(&flags).unwrap();
        assert!(hint.contains("Could not reach"));
        assert!(failure_hint_from_flags(&[]).is_none());
    }
}
