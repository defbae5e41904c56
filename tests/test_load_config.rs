use notebook_scheduler::load_config::{load_manifest, parse_manifest, ConfigError, PostDirective};
use std::fs::write;
use tempfile::NamedTempFile;

/// A manifest with every directive kind loads into typed entries, in order.
#[test]
fn test_load_manifest_success_all_directive_kinds() {
    let manifest_json = r#"{
  "daily_kpis": {
    "interval": "30 6 * * *",
    "posts": [
      {"process": "upload_gsheet_csv", "glob": "kpis.csv", "sheet_id": "abc", "sheet_range": "Data!A1"},
      {"process": "upload_gdrive_overwrite", "glob": "*.xlsx", "file_name": "kpis.xlsx",
       "mime_type": "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
       "parent_dir_id": "folder-1"},
      {"process": "upload_gdrive_compressed_file", "glob": "raw.json", "file_name": "raw.json.gz"},
      {"process": "upload_gdrive_compressed_files", "glob": "parts/*.csv", "file_name": "parts.tar.gz",
       "parent_dir_id": "folder-2"}
    ]
  },
  "adhoc": {"interval": null, "posts": []}
}"#;
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), manifest_json).unwrap();

    let manifest = load_manifest(file.path()).expect("Manifest should load");
    assert_eq!(manifest.notebooks.len(), 2);

    let daily = manifest.get("daily_kpis").expect("daily_kpis entry");
    assert!(daily.interval.is_scheduled());
    assert_eq!(daily.interval.to_string(), "30 6 * * *");
    let kinds: Vec<&str> = daily.posts.iter().map(|p| p.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            "upload_gsheet_csv",
            "upload_gdrive_overwrite",
            "upload_gdrive_compressed_file",
            "upload_gdrive_compressed_files",
        ]
    );
    match &daily.posts[1] {
        PostDirective::UploadGdriveOverwrite(d) => {
            assert_eq!(d.file_name, "kpis.xlsx");
            assert_eq!(d.parent_dir_id.as_deref(), Some("folder-1"));
            assert_eq!(d.path_to_file, None);
        }
        other => panic!("unexpected directive {other:?}"),
    }

    let adhoc = manifest.get("adhoc").expect("adhoc entry");
    assert!(!adhoc.interval.is_scheduled());
}

#[test]
fn test_unknown_process_is_a_config_error() {
    let err = parse_manifest(
        r#"{"nb": {"interval": "@daily", "posts": [{"process": "upload_s3", "glob": "*"}]}}"#,
    )
    .unwrap_err();
    match err.downcast_ref::<ConfigError>() {
        Some(ConfigError::UnknownProcess { notebook, process }) => {
            assert_eq!(notebook, "nb");
            assert_eq!(process, "upload_s3");
        }
        other => panic!("expected UnknownProcess, got {other:?}"),
    }
}

#[test]
fn test_directive_without_process_is_a_config_error() {
    let err = parse_manifest(
        r#"{"nb": {"interval": "@daily", "posts": [
            {"process": "upload_gsheet_csv", "glob": "*.csv", "sheet_id": "s", "sheet_range": "A1"},
            {"glob": "*.csv", "file_name": "x.csv"}
        ]}}"#,
    )
    .unwrap_err();
    match err.downcast_ref::<ConfigError>() {
        Some(ConfigError::MissingProcess { notebook, index }) => {
            assert_eq!(notebook, "nb");
            assert_eq!(*index, 1);
        }
        other => panic!("expected MissingProcess, got {other:?}"),
    }
}

#[test]
fn test_directive_missing_required_field_is_rejected() {
    let err = parse_manifest(
        r#"{"nb": {"interval": "@daily", "posts": [{"process": "upload_gsheet_csv", "glob": "*.csv"}]}}"#,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::InvalidDirective { index: 0, .. })
    ));
}

#[test]
fn test_invalid_interval_is_rejected() {
    let err = parse_manifest(r#"{"nb": {"interval": "every tuesday", "posts": []}}"#).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::InvalidInterval { .. })
    ));
}

#[test]
fn test_malformed_json_fails() {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), "{ not json").unwrap();
    assert!(load_manifest(file.path()).is_err());
}

#[test]
fn test_missing_manifest_file_fails() {
    assert!(load_manifest("/definitely/not/here/notebooks.json").is_err());
}

#[test]
fn test_sunday_as_zero_loads_and_fires_on_sunday() {
    use chrono::{Datelike, TimeZone, Utc, Weekday};

    let manifest = parse_manifest(r#"{"weekly": {"interval": "0 6 * * 0", "posts": []}}"#)
        .expect("Sunday written as 0 should load");
    let after = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
    let next = manifest
        .get("weekly")
        .unwrap()
        .interval
        .next_after(after)
        .unwrap();
    assert_eq!(next.weekday(), Weekday::Sun);
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).unwrap());
}
