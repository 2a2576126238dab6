use std::io::Write;
use std::time::Duration;

use dagwright_core::{DagError, EngineConfig};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
primary_output_key = "result"
command_timeout_secs = 12.5
max_iterations = 40
event_capacity = 1024

[log]
filter = "dagwright=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.primary_output_key, "result");
    assert_eq!(config.engine.command_timeout(), Duration::from_millis(12_500));
    assert_eq!(config.engine.max_iterations, 40);
    assert_eq!(config.engine.event_capacity, 1024);
    assert_eq!(config.log.filter, "dagwright=debug");
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("DAGWRIGHT_TEST_LOG_FILTER", "dagwright=trace");
    let toml_content = r#"
[log]
filter = "${DAGWRIGHT_TEST_LOG_FILTER}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.log.filter, "dagwright=trace");
    assert_eq!(config.engine.primary_output_key, "stdout");
    std::env::remove_var("DAGWRIGHT_TEST_LOG_FILTER");
}

#[test]
fn test_missing_file_is_reported() {
    let err = EngineConfig::load(std::path::Path::new("/nonexistent/dagwright.toml")).unwrap_err();
    assert!(matches!(err, DagError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_toml_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_iterations = ").expect("write toml");

    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, DagError::Config(_)));
}

#[test]
fn test_zero_event_capacity_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nevent_capacity = 0\n").expect("write toml");

    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(err.to_string().contains("event_capacity"));
}
