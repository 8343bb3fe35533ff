use super::*;
use serial_test::serial;

fn clear_kernel_env() {
    for key in [
        "PORT",
        "WORK_DIR",
        "CLI_PATH",
        "MAX_CONCURRENT_AGENTS",
        "KV_URL",
        "DEFAULT_LOCK_TTL_SECONDS",
        "APPROVAL_QUEUE_CAP",
        "USAGE_RETENTION_DAYS",
        "DATABASE_PATH",
    ] {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn defaults_apply_when_environment_is_empty() {
    clear_kernel_env();

    let config = Config::from_env().unwrap();
    assert_eq!(config.port, constants::DEFAULT_PORT);
    assert_eq!(config.cli_path, "claude");
    assert_eq!(config.max_concurrent_agents, 5);
    assert_eq!(config.default_lock_ttl_seconds, 300);
    assert_eq!(config.approval_queue_cap, 1000);
    assert_eq!(config.usage_retention_days, 90);
    assert!(config.kv_url.is_none());
}

#[test]
#[serial]
fn environment_overrides_are_honoured() {
    clear_kernel_env();
    env::set_var("PORT", "9000");
    env::set_var("MAX_CONCURRENT_AGENTS", "3");
    env::set_var("KV_URL", "redis://127.0.0.1:6379");

    let config = Config::from_env().unwrap();
    assert_eq!(config.port, 9000);
    assert_eq!(config.max_concurrent_agents, 3);
    assert_eq!(config.kv_url.as_deref(), Some("redis://127.0.0.1:6379"));

    clear_kernel_env();
}

#[test]
#[serial]
fn invalid_values_are_configuration_errors() {
    clear_kernel_env();
    env::set_var("MAX_CONCURRENT_AGENTS", "not-a-number");

    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, KernelError::Configuration(_)));

    env::set_var("MAX_CONCURRENT_AGENTS", "0");
    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, KernelError::Configuration(_)));

    clear_kernel_env();
}

#[test]
#[serial]
fn blank_kv_url_counts_as_unset() {
    clear_kernel_env();
    env::set_var("KV_URL", "   ");

    let config = Config::from_env().unwrap();
    assert!(config.kv_url.is_none());

    clear_kernel_env();
}
