use spliceproxy_config::{Config, Protocol};
use std::path::PathBuf;

fn get_test_config_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("test_configs");
    path.push(filename);
    path
}

#[test]
fn test_basic_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_basic.yaml"))
        .expect("Failed to load basic config");

    assert_eq!(config.listen.http, vec!["0.0.0.0:8080"]);
    assert_eq!(config.listen.https, vec!["0.0.0.0:8443"]);
    assert_eq!(config.catchall.http, "deny.internal:8080");
    assert_eq!(config.catchall.https, "deny.internal:8443");

    // Everything else falls back to defaults
    assert_eq!(config.timeout, 60);
    assert_eq!(config.buffer, 4096);
    assert!(config.proxy.is_empty());
    assert!(!config.forceipv4);
    assert!(!config.catchall.serve);
    assert!(config.alloweddomains.is_empty());
    assert_eq!(config.check, 0);
    assert!(!config.metrics.enabled);
}

#[test]
fn test_full_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_full.yaml"))
        .expect("Failed to load full config");

    assert_eq!(config.timeout, 15);
    assert_eq!(config.buffer, 8192);
    assert_eq!(config.listen.http.len(), 2);
    assert_eq!(config.listen.https.len(), 1);
    assert!(config.forceipv4);
    assert_eq!(config.proxy, "http://proxy.internal:3128");

    assert!(config.catchall.serve);
    assert_eq!(config.catchall.cert, "/etc/spliceproxy/cert.pem");
    assert_eq!(config.catchall.key, "/etc/spliceproxy/key.pem");

    assert_eq!(config.alloweddomains.len(), 3);
    assert_eq!(config.alloweddomains[0].name, "example.com");
    assert_eq!(config.alloweddomains[0].protocol, Protocol::Both);
    assert_eq!(config.alloweddomains[1].protocol, Protocol::Http);
    assert_eq!(config.alloweddomains[2].protocol, Protocol::Https);

    assert_eq!(config.check, 5);
    assert!(config.metrics.enabled);
    assert_eq!(config.metrics.address, "0.0.0.0:9090");
}

#[test]
fn test_routing_from_loaded_config() {
    let config = Config::from_file(&get_test_config_path("test_full.yaml"))
        .expect("Failed to load full config");

    let (dest, catchall) = config.route("t", "www.example.com", ":443", true);
    assert_eq!(dest, "www.example.com:443");
    assert!(!catchall);

    let (dest, catchall) = config.route("t", "blocked.test", ":443", true);
    assert_eq!(dest, "deny.internal:8443");
    assert!(catchall);

    let (dest, catchall) = config.route("t", "blocked.test", ":80", false);
    assert_eq!(dest, "deny.internal:8080");
    assert!(catchall);
}

#[test]
fn test_config_missing_required_field() {
    let yaml = r#"
listen:
  http:
    - "0.0.0.0:8080"
catchall:
  http: "deny.internal:80"
"#;

    let result = Config::parse(yaml);
    assert!(
        result.is_err(),
        "Should fail when catchall.https is missing"
    );
}

#[test]
fn test_config_invalid_yaml() {
    let yaml = r#"
listen: [invalid
catchall:
  - invalid
"#;

    let result = Config::parse(yaml);
    assert!(result.is_err(), "Should fail on invalid YAML");
}
