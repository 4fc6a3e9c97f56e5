//! Loading the JSON settings file and turning it into a consumer configuration.

use anyhow::{anyhow, Context, Result};
use smile_consumer::{
    parse_start_date, ClientConfig, ClientConfigBuilder, ConfigError, HandlerError,
    HandlerRegistry, MessageEnvelope, Settings,
};
use std::path::Path;

/// Name of the handler that prints each message to stdout.
pub const PRINT_HANDLER: &str = "print";

/// Read a settings file. The top level must be a JSON object.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Config file {} is not valid JSON", path.display()))?;

    match value {
        serde_json::Value::Object(settings) => Ok(settings),
        other => Err(anyhow!(
            "Config file {} must contain a JSON object, found {}",
            path.display(),
            json_type(&other)
        )),
    }
}

/// Handlers the command line tool can select through `CALLBACK`.
pub fn handler_registry() -> HandlerRegistry {
    HandlerRegistry::new().with_handler(
        PRINT_HANDLER,
        |envelope: &MessageEnvelope| -> Result<(), HandlerError> {
            println!("{envelope}");
            Ok(())
        },
    )
}

/// Combine the settings file with the command line overrides.
///
/// `subject` selects the stream; `start_date` (`YYYY-MM-DD`) replays from midnight UTC.
pub fn client_config(
    settings: &Settings,
    subject: &str,
    start_date: Option<&str>,
) -> Result<ClientConfig, ConfigError> {
    let start_time = start_date.map(parse_start_date).transpose()?;

    ClientConfigBuilder::from_settings(settings, &handler_registry())?
        .with_subject(subject)
        .with_start_time(start_time)
        .build()
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn settings() -> Settings {
        match json!({
            "NATS_URL": "nats://localhost:4222",
            "NATS_FILTER_SUBJECT": "S.*",
            "NATS_DURABLE": "d1",
            "CLIENT_TIMEOUT": 2.5,
        }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_settings() {
        let file = write_config(&serde_json::to_string(&settings()).unwrap());
        let loaded = load_settings(file.path()).unwrap();
        assert_eq!(loaded, settings());
    }

    #[rstest]
    #[case("not json", "not valid JSON")]
    #[case("[1, 2]", "must contain a JSON object, found an array")]
    fn test_load_settings_rejects(#[case] contents: &str, #[case] expected: &str) {
        let file = write_config(contents);
        let error = load_settings(file.path()).unwrap_err();
        assert!(
            format!("{error:#}").contains(expected),
            "unexpected error: {error:#}"
        );
    }

    #[test]
    fn test_missing_file() {
        let error = load_settings(Path::new("/nonexistent/smile.json")).unwrap_err();
        assert!(error.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_client_config_applies_overrides() {
        let config = client_config(&settings(), "S.a", Some("2024-01-15")).unwrap();
        assert_eq!(config.subject(), "S.a");
        assert_eq!(config.filter_subject(), "S.*");
        assert_eq!(
            config.start_time(),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_client_config_rejects_bad_date() {
        let error = client_config(&settings(), "S.a", Some("15/01/2024")).unwrap_err();
        assert_eq!(error, ConfigError::InvalidStartDate("15/01/2024".to_string()));
    }

    #[test]
    fn test_print_handler_is_selectable() {
        let mut settings = settings();
        settings.insert("CALLBACK".to_string(), json!(PRINT_HANDLER));
        assert!(client_config(&settings, "S.a", None).is_ok());

        settings.insert("CALLBACK".to_string(), json!("missing"));
        assert!(matches!(
            client_config(&settings, "S.a", None),
            Err(ConfigError::UnknownHandler(_))
        ));
    }
}
