//! Configuration loading from files and validation failures.

use std::io::Write;
use std::time::Duration;

use tollgate::config::Config;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn load_explicit_file() {
    let file = write_config(
        r#"
        [server]
        address = "127.0.0.1:8100"

        [rate_limit]
        capacity = 20
        refill_per_sec = 2.0

        [storage]
        reports_dir = "/srv/tollgate/reports"
        memories_dir = "/srv/tollgate/memories"
    "#,
    );

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.socket_addr().unwrap().port(), 8100);
    assert_eq!(config.rate_limit_config().default_limits.capacity, 20);
    assert_eq!(
        config.storage_router().unwrap().root_for(tollgate::Category::Memory),
        std::path::Path::new("/srv/tollgate/memories")
    );
}

#[test]
fn missing_explicit_file_is_an_error() {
    let err = Config::load(Some(std::path::Path::new("/nonexistent/tollgate.toml"))).unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(err.to_string().contains("not found"));
}

#[test]
fn parse_errors_name_the_file() {
    let file = write_config("[server\naddress = 1");
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains(".toml"));
}

fn with_roots(extra: &str) -> Config {
    Config::from_toml_str(&format!(
        r#"
        [storage]
        reports_dir = "/r"
        memories_dir = "/m"
        {extra}
    "#
    ))
    .unwrap()
}

#[test]
fn invalid_values_are_rejected() {
    let cases = [
        ("[server]\naddress = \"not an address\"", "server.address"),
        ("[cache]\ndefault_ttl_secs = 0", "default_ttl_secs"),
        ("[rate_limit]\ncapacity = 0", "capacity"),
        ("[rate_limit]\nrefill_per_sec = 0.0", "refill_per_sec"),
        ("[rate_limit]\nidle_secs = 0", "idle_secs"),
        ("[retry]\nmax_attempts = 0", "max_attempts"),
        ("[retry]\njitter = 1.5", "jitter"),
        ("[retry]\nmultiplier = 0.5", "multiplier"),
        ("[agent]\nurl = \"not a url\"", "agent.url"),
        ("[agent]\nprovider = \"  \"", "agent.provider"),
    ];
    for (toml, field) in cases {
        let err = with_roots(toml).validate().unwrap_err();
        assert!(
            err.to_string().contains(field),
            "expected error mentioning {field}, got {err}"
        );
    }
}

#[test]
fn relative_storage_roots_are_rejected() {
    let config = Config::from_toml_str(
        r#"
        [storage]
        reports_dir = "reports"
        memories_dir = "/m"
    "#,
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("must be absolute"));
}

#[test]
fn zero_attempt_timeout_disables_deadline() {
    let config = with_roots("[retry]\nattempt_timeout_secs = 0");
    assert!(config.validate().is_ok());
    assert_eq!(config.retry_config().attempt_timeout, None);

    let config = with_roots("");
    assert_eq!(
        config.retry_config().attempt_timeout,
        Some(Duration::from_secs(120))
    );
}
