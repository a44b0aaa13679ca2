use super::*;

#[test]
fn test_load_config_missing_file_returns_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.json");
    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.gateway.port, 18800);
    assert_eq!(config.session.credential_timeout_secs, 60);
}

#[test]
fn test_load_config_minimal_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"routing": {"maxConversationsPerAgent": 8}}"#).unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.routing.max_conversations_per_agent, 8);
    assert!(config.routing.auto_assignment);
}

#[test]
fn test_load_config_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"session": {"credentialTimeoutSecs": 0}}"#).unwrap();

    let err = load_config(Some(&path)).unwrap_err();
    match err {
        ZapdeskError::Config(msg) => {
            assert!(msg.contains("credentialTimeoutSecs"), "got: {msg}");
            assert!(msg.contains("config.json"), "got: {msg}");
        }
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn test_load_config_rejects_malformed_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        load_config(Some(&path)),
        Err(ZapdeskError::Config(ref msg)) if msg.contains("invalid JSON")
    ));
}

#[test]
fn test_load_config_rejects_out_of_range_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        format!(r#"{{"workingHours": {{"utcOffsetMinutes": {}}}}}"#, i32::MIN),
    )
    .unwrap();
    assert!(matches!(
        load_config(Some(&path)),
        Err(ZapdeskError::Config(ref msg)) if msg.contains("utcOffsetMinutes")
    ));
}

#[cfg(unix)]
#[test]
fn test_unreadable_path_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the file should be.
    let path = dir.path().join("config.json");
    std::fs::create_dir(&path).unwrap();
    assert!(matches!(
        load_config(Some(&path)),
        Err(ZapdeskError::Config(_))
    ));
}

#[test]
fn test_save_then_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let mut config = Config::default();
    config.gateway.port = 19000;
    config.working_hours.utc_offset_minutes = -180;
    save_config(&config, Some(&path)).unwrap();

    let loaded = load_config(Some(&path)).unwrap();
    assert_eq!(loaded.gateway.port, 19000);
    assert_eq!(loaded.working_hours.utc_offset_minutes, -180);

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("\"workingHours\""));
    assert!(raw.contains("\"utcOffsetMinutes\""));
}

#[cfg(unix)]
#[test]
fn test_saved_config_is_private() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    save_config(&Config::default(), Some(&path)).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
