pub mod common;
pub mod failure_injection;
pub mod scenarios;

pub fn init_test_environment() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("camera_grid=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration text for `streams` (name and uri pairs) polling every 20ms
/// and retrying with the given backoff bounds.
pub fn test_config(base_backoff_ms: u64, max_backoff_ms: u64, streams: &[(&str, &str)]) -> String {
    let mut config = format!(
        r#"
[app]
poll_interval_ms = 20
shutdown_timeout_seconds = 2

[recovery]
profile = "custom"
base_backoff_ms = {}
max_backoff_ms = {}
negotiation_timeout_seconds = 1
"#,
        base_backoff_ms, max_backoff_ms
    );
    for (name, uri) in streams {
        config.push_str(&format!(
            "\n[[streams]]\nname = \"{}\"\nuri = \"{}\"\n",
            name, uri
        ));
    }
    config
}
