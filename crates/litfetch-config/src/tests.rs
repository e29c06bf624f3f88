use super::*;
use std::io::Write;

#[test]
fn test_defaults_match_documented_values() {
    let acq = AcquisitionConfig::default();
    assert_eq!(acq.timeout(), Duration::from_secs(30));
    assert!((acq.crossref_min_similarity - 0.85).abs() < 1e-9);
    assert!((acq.title_similarity_threshold - 0.5).abs() < 1e-9);
    assert_eq!(acq.max_attempts, 3);
    assert!(acq.use_browser_fallback);
    assert!(!acq.delete_on_mismatch);
    assert_eq!(acq.mode, AcquisitionMode::Interactive);
}

#[test]
fn test_backoff_schedule_repeats_last_entry() {
    let acq = AcquisitionConfig::default();
    assert_eq!(acq.backoff_for(1), Duration::from_secs(1));
    assert_eq!(acq.backoff_for(2), Duration::from_secs(3));
    assert_eq!(acq.backoff_for(3), Duration::from_secs(9));
    assert_eq!(acq.backoff_for(7), Duration::from_secs(9));

    let no_wait = AcquisitionConfig { backoff_secs: vec![], ..Default::default() };
    assert_eq!(no_wait.backoff_for(1), Duration::ZERO);
}

#[test]
fn test_partial_toml_fills_defaults() {
    let config = Config::from_toml_str(
        r#"
        [acquisition]
        skip_resolvers = ["openathens_proxy"]
        delete_on_mismatch = true
        mode = "unattended"

        [storage]
        base_dir = "/tmp/papers"
        "#,
    )
    .unwrap();
    assert_eq!(config.acquisition.skip_resolvers, vec!["openathens_proxy".to_string()]);
    assert!(config.acquisition.discard_mismatches());
    assert_eq!(config.storage.base_dir, PathBuf::from("/tmp/papers"));
    assert_eq!(config.network.requests_per_second, 3);
    config.validate().unwrap();
}

#[test]
fn test_timeout_accepted_under_short_name() {
    let config = Config::from_toml_str("[acquisition]\ntimeout = 12\n").unwrap();
    assert_eq!(config.acquisition.timeout(), Duration::from_secs(12));
}

#[test]
fn test_delete_on_mismatch_ignored_in_interactive_mode() {
    let acq = AcquisitionConfig { delete_on_mismatch: true, ..Default::default() };
    assert!(!acq.discard_mismatches());
    assert!(acq.discard_mismatches_in(AcquisitionMode::Unattended));
}

#[test]
fn test_unknown_skip_resolver_rejected() {
    let mut config = Config::default();
    config.acquisition.skip_resolvers = vec!["scihub".to_string()];
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("scihub")));
}

#[test]
fn test_threshold_out_of_range_rejected() {
    let mut config = Config::default();
    config.acquisition.title_similarity_threshold = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn test_openathens_requires_proxy_url() {
    let mut config = Config::default();
    config.acquisition.openathens_enabled = true;
    assert!(config.validate().is_err());

    config.acquisition.openathens_proxy_url = Some("https://go.openathens.net/redirector/example.edu?url=".to_string());
    config.validate().unwrap();
    assert!(config.acquisition.openathens_active());
}

#[test]
fn test_env_overrides_applied() {
    let mut config = Config::default();
    config.apply_overrides_from(|key| match key {
        "LITFETCH_UNPAYWALL_EMAIL" => Some("librarian@example.org".to_string()),
        "LITFETCH_BASE_DIR" => Some("/srv/library".to_string()),
        _ => None,
    });
    assert_eq!(config.acquisition.unpaywall_email.as_deref(), Some("librarian@example.org"));
    assert_eq!(config.storage.base_dir, PathBuf::from("/srv/library"));
    assert!(config.acquisition.openathens_proxy_url.is_none());
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[acquisition]\ntimeout_secs = 12\n[network]\nrequests_per_second = 1").unwrap();
    let config = Config::load_from(file.path()).unwrap();
    assert_eq!(config.acquisition.timeout_secs, 12);
    assert_eq!(config.network.requests_per_second, 1);
}

#[test]
fn test_example_config_is_valid() {
    let config = Config::from_toml_str(include_str!("../../../litfetch.example.toml")).unwrap();
    config.validate().unwrap();
    assert_eq!(config.acquisition.backoff_secs, vec![1, 3, 9]);
    assert_eq!(config.storage.catalog_path, PathBuf::from("./library/catalog.json"));
}
