use std::env;
use std::sync::OnceLock;

static CMDGRAPH_API_TRACE: OnceLock<bool> = OnceLock::new();
static CMDGRAPH_BACKEND: OnceLock<Option<String>> = OnceLock::new();

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// `CMDGRAPH_API_TRACE`: record API calls and print them to stdout.
pub(crate) fn api_trace_enabled() -> bool {
    *CMDGRAPH_API_TRACE.get_or_init(|| match env::var("CMDGRAPH_API_TRACE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// `CMDGRAPH_BACKEND`: registry name of the backend used by [`crate::RuntimeConfig::from_env`].
pub(crate) fn backend_override() -> Option<&'static str> {
    CMDGRAPH_BACKEND
        .get_or_init(|| match env::var("CMDGRAPH_BACKEND") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        })
        .as_deref()
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool(" On "));
        assert!(parse_bool("1"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
    }
}
