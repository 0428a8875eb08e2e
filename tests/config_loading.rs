use std::io::Write;

use weave_core::config::{AppConfig, BackoffKind};
use weave_core::error::WeaveError;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[runtime]
max_concurrent_executions = 4
default_provider = "openai"

[runtime.backoff]
initial_backoff_ms = 200
max_backoff_ms = 5000
jitter_ratio = 0.1

[queue]
name = "nightly"
database = "/tmp/weave-test/queue.db"
poll_interval_ms = 50
concurrency = 2

[queue.default_job_options]
attempts = 5
remove_on_complete = 10

[queue.default_job_options.backoff]
kind = "fixed"
delay_ms = 250

[[agents]]
name = "researcher"
model = "claude-3-5-sonnet"
system_prompt = "Find sources."
max_retries = 2
timeout_ms = 60000
max_tokens = 2048
tools = ["search"]

[[agents]]
name = "writer"
provider = "local"
model = "llama3:8b"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runtime.max_concurrent_executions, 4);
    assert_eq!(config.runtime.default_provider.as_deref(), Some("openai"));
    assert_eq!(config.runtime.backoff.initial_backoff_ms, 200);
    assert_eq!(config.runtime.backoff.max_backoff_ms, 5000);

    let queue = config.queue.expect("queue present");
    assert_eq!(queue.name, "nightly");
    assert_eq!(queue.concurrency, 2);
    assert_eq!(queue.default_job_options.attempts, 5);
    assert_eq!(queue.default_job_options.remove_on_complete, 10);
    assert_eq!(queue.default_job_options.remove_on_fail, 500);
    assert_eq!(queue.default_job_options.backoff.kind, BackoffKind::Fixed);
    assert_eq!(queue.default_job_options.backoff.delay_ms, 250);

    assert_eq!(config.agents.len(), 2);
    let researcher = &config.agents[0];
    assert_eq!(researcher.model, "claude-3-5-sonnet");
    assert_eq!(researcher.max_tokens, Some(2048));
    assert_eq!(researcher.tools, vec!["search"]);
    assert_eq!(config.agents[1].provider.as_deref(), Some("local"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEAVE_TEST_DEFAULT_PROVIDER", "anthropic");

    let tmp = write_config(
        r#"
[runtime]
default_provider = "${WEAVE_TEST_DEFAULT_PROVIDER}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.runtime.default_provider.as_deref(), Some("anthropic"));

    std::env::remove_var("WEAVE_TEST_DEFAULT_PROVIDER");
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = write_config("");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runtime.max_concurrent_executions, 10);
    assert_eq!(config.runtime.backoff.initial_backoff_ms, 1000);
    assert_eq!(config.runtime.backoff.max_backoff_ms, 30_000);
    assert!(config.runtime.default_provider.is_none());
    assert!(config.queue.is_none());
    assert!(config.agents.is_empty());
}

#[test]
fn test_invalid_agent_is_rejected() {
    let tmp = write_config(
        r#"
[[agents]]
name = "hasty"
timeout_ms = 10
"#,
    );

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, WeaveError::InvalidAgentConfig(_)));
}

#[test]
fn test_missing_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/weave.toml")).unwrap_err();
    assert!(matches!(err, WeaveError::ConfigNotFound(_)));
}
