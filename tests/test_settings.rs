use notebook_scheduler::config::{resolve_settings, Settings, CLIENT_SECRETS_ENV};
use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{tempdir, NamedTempFile};

#[test]
#[serial]
fn test_root_layout_uses_conventional_paths() {
    env::remove_var(CLIENT_SECRETS_ENV);
    let settings = resolve_settings(None, Some(Path::new("/srv/nb"))).expect("Settings should resolve");

    assert_eq!(settings.notebooks_dir, PathBuf::from("/srv/nb/notebooks"));
    assert_eq!(settings.output_dir, PathBuf::from("/srv/nb/output"));
    assert_eq!(settings.manifest_path, PathBuf::from("/srv/nb/config/notebooks.json"));
    assert_eq!(settings.token_path(), PathBuf::from("/srv/nb/credentials/g_oauth_clt.json"));
    assert_eq!(settings.client_secrets_path, None);
    assert_eq!(settings.run_timeout(), Duration::from_secs(60 * 60));
    assert!(settings.interactive_auth);
    assert_eq!(settings.runner.program, "papermill");
}

#[test]
#[serial]
fn test_yaml_settings_apply_defaults_and_env_override() {
    let config_yaml = r#"
notebooks_dir: /data/notebooks
output_dir: /data/output
manifest_path: /data/notebooks.json
credentials_dir: /data/credentials
runner:
  kernel: python3
interactive_auth: false
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();

    env::set_var(CLIENT_SECRETS_ENV, "/secrets/client.json");
    let settings = resolve_settings(Some(config_file.path()), None).expect("Settings should load");
    env::remove_var(CLIENT_SECRETS_ENV);

    assert_eq!(settings.notebooks_dir, PathBuf::from("/data/notebooks"));
    assert_eq!(settings.runner.program, "papermill");
    assert_eq!(settings.runner.kernel.as_deref(), Some("python3"));
    assert_eq!(settings.run_timeout_minutes, 60);
    assert!(!settings.interactive_auth);
    assert_eq!(
        settings.client_secrets_path,
        Some(PathBuf::from("/secrets/client.json"))
    );
}

#[test]
#[serial]
fn test_malformed_settings_fail() {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), "notebooks_dir: [unterminated").unwrap();
    assert!(Settings::load(config_file.path()).is_err());
}

#[test]
fn test_validate_requires_notebook_dir() {
    let root = tempdir().unwrap();
    let settings = Settings::from_root(root.path());
    assert!(settings.validate().is_err());

    std::fs::create_dir_all(root.path().join("notebooks")).unwrap();
    assert!(settings.validate().is_ok());
}
