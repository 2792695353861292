use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The `Display` form quotes the offending source line; broker credentials live in the
        // same file, so keep only the message.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

/// Redact user-supplied values from a `toml`/`serde` diagnostic, keeping schema names.
pub(crate) fn sanitize_toml_error_message(message: &str) -> String {
    static DOUBLE_QUOTED: OnceLock<Option<regex::Regex>> = OnceLock::new();
    static SINGLE_QUOTED: OnceLock<Option<regex::Regex>> = OnceLock::new();

    let mut out = message.to_owned();
    if let Some(re) = DOUBLE_QUOTED
        .get_or_init(|| regex::Regex::new(r#""(?:\\.|[^"\\])*""#).ok())
        .as_ref()
    {
        out = re.replace_all(&out, r#""<redacted>""#).into_owned();
    }
    if let Some(re) = SINGLE_QUOTED
        .get_or_init(|| regex::Regex::new(r"'(?:\\.|[^'\\])*'").ok())
        .as_ref()
    {
        out = re.replace_all(&out, "'<redacted>'").into_owned();
    }

    // `missing field `x`` names a schema field and stays; everything else in backticks before
    // `, expected` is user input.
    let start = ["unknown field `", "unknown variant `", "invalid type: ", "invalid value: "]
        .iter()
        .filter_map(|pattern| out.find(pattern).map(|pos| pos + pattern.len()))
        .min();
    if let Some(start) = start {
        let boundary = out[start..]
            .find(", expected")
            .map_or(out.len(), |rel| start + rel);
        if let Some(open) = out[..boundary].rfind('`').filter(|&pos| pos + 1 >= start) {
            if let Some(first) = out[..open].rfind('`').filter(|&pos| pos + 1 >= start) {
                out.replace_range(first + 1..open, "<redacted>");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_quoted_values() {
        let sanitized =
            sanitize_toml_error_message(r#"invalid type: string "hunter2", expected u16"#);
        assert!(!sanitized.contains("hunter2"), "{sanitized}");
        assert!(sanitized.contains("expected u16"), "{sanitized}");
    }

    #[test]
    fn redacts_unknown_field_names_but_keeps_missing_ones() {
        let sanitized = sanitize_toml_error_message(
            "unknown field `secret-key`, expected one of `host`, `port`",
        );
        assert!(!sanitized.contains("secret-key"), "{sanitized}");
        assert!(sanitized.contains("`host`"), "{sanitized}");

        let sanitized = sanitize_toml_error_message("missing field `host`");
        assert_eq!(sanitized, "missing field `host`");
    }

    #[test]
    fn redacts_backticked_scalars() {
        let sanitized =
            sanitize_toml_error_message("invalid type: integer `9201`, expected a string");
        assert!(!sanitized.contains("9201"), "{sanitized}");
    }
}
