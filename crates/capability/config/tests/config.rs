use pubsub_config::{
    AppConfig, ConfigError, PayloadPolicyKind, SourceKind, TransportKind, VariantEncodingKind,
};
use std::sync::Mutex;

// 环境变量为进程级共享状态，测试之间串行执行。
static ENV_LOCK: Mutex<()> = Mutex::new(());

const KEYS: &[&str] = &[
    "PUBSUB_TRANSPORT",
    "PUBSUB_BROKER_HOST",
    "PUBSUB_BROKER_PORT",
    "PUBSUB_CLIENT_ID",
    "PUBSUB_SHARED_KEY",
    "PUBSUB_TELEMETRY_TOPIC",
    "PUBSUB_PAYLOAD_POLICY",
    "PUBSUB_VARIANT_ENCODING",
    "PUBSUB_SOURCE",
    "PUBSUB_SOURCE_HOST",
    "PUBSUB_SOURCE_PORT",
    "PUBSUB_INTERVAL_MS",
    "PUBSUB_MAX_ITERATIONS",
    "PUBSUB_RECONNECT_MAX_ATTEMPTS",
];

fn reset_env() {
    // Rust 2024 中 set_var/remove_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }
}

#[test]
fn load_config_with_defaults() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    reset_env();
    unsafe {
        std::env::set_var("PUBSUB_BROKER_HOST", "hub.example");
        std::env::set_var("PUBSUB_CLIENT_ID", "dev1");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.transport, TransportKind::Mqtt);
    assert_eq!(config.broker_port, 8883);
    assert!(config.tls);
    assert_eq!(config.telemetry_topic, "devices/dev1/messages/events/");
    assert_eq!(config.command_namespace, "dev1");
    assert_eq!(config.publisher_id, "dev1");
    assert_eq!(config.payload_field, "Energy");
    assert_eq!(config.payload_policy, PayloadPolicyKind::Accumulate);
    assert_eq!(config.variant_encoding, VariantEncodingKind::Reversible);
    assert_eq!(
        config.source,
        SourceKind::Fixture {
            path: "energy.csv".to_string()
        }
    );
    assert_eq!(config.interval_ms, 1000);
    assert_eq!(config.sas_validity_seconds, 604_800);
    assert_eq!(config.reconnect_delay_ms, 5000);
    assert!(config.max_iterations.is_none());
    assert!(config.auto_reconnect());
}

#[test]
fn load_kafka_config_with_tcp_source() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    reset_env();
    unsafe {
        std::env::set_var("PUBSUB_TRANSPORT", "kafka");
        std::env::set_var("PUBSUB_BROKER_HOST", "ns.servicebus.example");
        std::env::set_var("PUBSUB_CLIENT_ID", "dev1");
        std::env::set_var("PUBSUB_PAYLOAD_POLICY", "gauge");
        std::env::set_var("PUBSUB_VARIANT_ENCODING", "plain");
        std::env::set_var("PUBSUB_SOURCE", "tcp");
        std::env::set_var("PUBSUB_SOURCE_HOST", "10.0.0.5");
        std::env::set_var("PUBSUB_SOURCE_PORT", "9000");
        std::env::set_var("PUBSUB_MAX_ITERATIONS", "10");
        std::env::set_var("PUBSUB_RECONNECT_MAX_ATTEMPTS", "3");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.transport, TransportKind::Kafka);
    assert_eq!(config.broker_port, 9093);
    assert!(!config.auto_reconnect());
    assert_eq!(config.payload_policy, PayloadPolicyKind::Gauge);
    assert_eq!(config.variant_encoding, VariantEncodingKind::Plain);
    assert_eq!(
        config.source,
        SourceKind::Tcp {
            host: "10.0.0.5".to_string(),
            port: 9000,
            request: None,
        }
    );
    assert_eq!(config.max_iterations, Some(10));
    assert_eq!(config.reconnect_max_attempts, Some(3));
}

#[test]
fn missing_and_invalid_values_are_reported() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    reset_env();
    unsafe {
        std::env::set_var("PUBSUB_CLIENT_ID", "dev1");
    }
    let err = AppConfig::from_env().expect_err("missing host");
    assert!(matches!(err, ConfigError::Missing(key) if key == "PUBSUB_BROKER_HOST"));

    unsafe {
        std::env::set_var("PUBSUB_BROKER_HOST", "hub.example");
        std::env::set_var("PUBSUB_INTERVAL_MS", "soon");
    }
    let err = AppConfig::from_env().expect_err("invalid interval");
    assert_eq!(err.to_string(), "invalid value for PUBSUB_INTERVAL_MS: soon");

    unsafe {
        std::env::remove_var("PUBSUB_INTERVAL_MS");
        std::env::set_var("PUBSUB_TRANSPORT", "carrier-pigeon");
    }
    let err = AppConfig::from_env().expect_err("invalid transport");
    assert!(matches!(err, ConfigError::Invalid(key, _) if key == "PUBSUB_TRANSPORT"));
}
