use super::*;
use std::time::Duration;

#[test]
fn empty_config_gets_defaults() {
    let config = parse("").unwrap();
    assert!(config.listeners.is_empty());
    assert_eq!(config.translation.socket_path, "/run/translation.sock");
    assert_eq!(config.cache.size, 64 * 1024 * 1024);
    assert!(config.cache.obey_no_cache);
    assert_eq!(config.session.idle_timeout, Duration::from_secs(1800));
    assert!(!config.cluster.sticky_cache);
}

#[test]
fn full_config_parses() {
    let raw = r#"
        [[listeners]]
        address = "0.0.0.0:8080"

        [[listeners]]
        address = "0.0.0.0:8443"
        auth_alt_host = "auth.internal"
        tls = { cert_db_dir = "/etc/certs" }

        [translation]
        socket_path = "/run/tr.sock"
        connections = 8

        [cluster]
        name = "web"
        sticky_cache = true
        members = [
            { key = "a", address = "10.0.0.1:8080" },
            { key = "b", address = "10.0.0.2:8080" },
        ]

        [cache]
        size = 1048576
        cacheable_size_limit = 65536
        obey_no_cache = false

        [session]
        idle_timeout = "10m"
        cluster_size = 4
        cluster_node = 2
        save_path = "/var/lib/trellis/sessions"

        [control]
        bind = "127.0.0.1:5478"

        [access_log]
        command = "/usr/bin/log-forwarder"
        args = ["--json"]
        uid = 99
    "#;
    let config = parse(raw).unwrap();
    assert_eq!(config.listeners.len(), 2);
    assert!(config.listeners[1].tls.is_some());
    assert_eq!(config.translation.connections, 8);
    assert_eq!(config.cluster.members.len(), 2);
    assert!(config.cluster.sticky_cache);
    assert_eq!(config.session.idle_timeout, Duration::from_secs(600));
    assert_eq!(config.session.cluster_node, 2);
    assert!(!config.cache.obey_no_cache);
    assert_eq!(config.access_log.command.as_deref(), Some("/usr/bin/log-forwarder"));
}

#[test]
fn cluster_node_out_of_range_is_rejected() {
    let raw = r#"
        [session]
        cluster_size = 2
        cluster_node = 2
    "#;
    assert!(parse(raw).is_err());
}

#[test]
fn unknown_fields_are_rejected() {
    assert!(parse("[cache]\nsizzle = 1\n").is_err());
}

#[test]
fn bad_duration_is_rejected() {
    assert!(parse("[session]\nidle_timeout = \"not a duration\"\n").is_err());
}
