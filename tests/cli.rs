use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::{create_dir_all, write};
use tempfile::{tempdir, TempDir};

/// Deployment root with two notebooks and a matching manifest.
fn create_deployment() -> TempDir {
    let root = tempdir().expect("Creating temp root failed");
    create_dir_all(root.path().join("notebooks")).unwrap();
    create_dir_all(root.path().join("config")).unwrap();
    write(root.path().join("notebooks/daily_kpis.ipynb"), "{}").unwrap();
    write(root.path().join("notebooks/adhoc.ipynb"), "{}").unwrap();
    write(
        root.path().join("config/notebooks.json"),
        r#"{
  "daily_kpis": {"interval": "30 6 * * *", "posts": []},
  "adhoc": {"interval": null, "posts": []}
}"#,
    )
    .unwrap();
    root
}

#[test]
fn list_prints_every_workflow_with_its_stage_chain() {
    let root = create_deployment();

    Command::cargo_bin("notebook-scheduler")
        .expect("Binary exists")
        .arg("--root")
        .arg(root.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("daily_kpis\t30 6 * * *"))
        .stdout(predicate::str::contains("adhoc\t@once"))
        .stdout(predicate::str::contains(
            "start -> cleanup -> execute -> post_process -> stop",
        ));
}

#[test]
fn unknown_process_fails_at_startup() {
    let root = create_deployment();
    write(
        root.path().join("config/notebooks.json"),
        r#"{"daily_kpis": {"interval": "@daily", "posts": [{"process": "upload_ftp"}]},
            "adhoc": {"posts": []}}"#,
    )
    .unwrap();

    Command::cargo_bin("notebook-scheduler")
        .expect("Binary exists")
        .arg("--root")
        .arg(root.path())
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("upload_ftp"));
}

#[test]
fn run_of_unknown_notebook_fails() {
    let root = create_deployment();

    Command::cargo_bin("notebook-scheduler")
        .expect("Binary exists")
        .arg("--root")
        .arg(root.path())
        .arg("run")
        .arg("nope")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No workflow named 'nope'"));
}

#[test]
fn gauth_without_arguments_prints_usage() {
    Command::cargo_bin("gauth")
        .expect("Binary exists")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn gauth_with_too_many_arguments_prints_usage() {
    Command::cargo_bin("gauth")
        .expect("Binary exists")
        .arg("one.json")
        .arg("two.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{:?}", event));
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use notebook_scheduler::cli::{run, Cli, Commands};

    // A settings file that does not exist; the run fails after the first event.
    let cli = Cli {
        config: Some(std::path::PathBuf::from("dummy.yaml")),
        root: None,
        command: Commands::List,
    };
    let _ = run(cli).await;

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
