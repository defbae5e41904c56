use async_trait::async_trait;
use notebook_scheduler::contract::{
    ApiError, MockFileStore, MockSpreadsheetApi, NotebookParameters, NotebookRunner,
};
use notebook_scheduler::scheduler::{Interval, Scheduler, TriggerOutcome};
use notebook_scheduler::workflow::{Services, Workflow, WorkflowError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Runner that takes a while and records how many runs overlap.
#[derive(Default)]
struct SlowRunner {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl NotebookRunner for SlowRunner {
    async fn execute(&self, _notebook: &Path, _params: &NotebookParameters) -> Result<(), ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn workflow(id: &str, timeout: Duration) -> Workflow {
    Workflow {
        id: id.to_string(),
        notebook: PathBuf::from(format!("{id}.ipynb")),
        interval: Interval::parse("@daily").unwrap(),
        timeout,
        posts: vec![],
    }
}

fn scheduler(runner: Arc<SlowRunner>, output_dir: PathBuf, workflows: Vec<Workflow>) -> Scheduler {
    let services = Services {
        runner,
        sheets: Arc::new(MockSpreadsheetApi::new()),
        drive: Arc::new(MockFileStore::new()),
    };
    Scheduler::new(services, output_dir, workflows)
}

const TS: &str = "2024-03-05T10:15:30+00:00";

#[tokio::test]
async fn second_trigger_while_active_is_skipped() {
    let out = tempdir().unwrap();
    let runner = Arc::new(SlowRunner {
        delay: Duration::from_millis(200),
        ..Default::default()
    });
    let scheduler = scheduler(
        runner.clone(),
        out.path().to_path_buf(),
        vec![workflow("nb", Duration::from_secs(60))],
    );

    let (first, second) = tokio::join!(scheduler.trigger("nb", TS), scheduler.trigger("nb", TS));

    assert!(matches!(first, Some(TriggerOutcome::Completed(_))));
    assert!(matches!(second, Some(TriggerOutcome::Skipped)));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

    // Once the first run is over the workflow can run again.
    let third = scheduler.trigger("nb", TS).await;
    assert!(matches!(third, Some(TriggerOutcome::Completed(_))));
}

#[tokio::test]
async fn different_workflows_never_share_the_output_dir() {
    let out = tempdir().unwrap();
    let runner = Arc::new(SlowRunner {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let scheduler = scheduler(
        runner.clone(),
        out.path().to_path_buf(),
        vec![
            workflow("a", Duration::from_secs(60)),
            workflow("b", Duration::from_secs(60)),
        ],
    );

    let (a, b) = tokio::join!(scheduler.trigger("a", TS), scheduler.trigger("b", TS));

    assert!(matches!(a, Some(TriggerOutcome::Completed(_))));
    assert!(matches!(b, Some(TriggerOutcome::Completed(_))));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_over_budget_times_out() {
    let out = tempdir().unwrap();
    let runner = Arc::new(SlowRunner {
        delay: Duration::from_secs(5),
        ..Default::default()
    });
    let scheduler = scheduler(
        runner,
        out.path().to_path_buf(),
        vec![workflow("slow", Duration::from_millis(50))],
    );

    let outcome = scheduler.trigger("slow", TS).await;
    assert!(matches!(
        outcome,
        Some(TriggerOutcome::Failed(WorkflowError::TimedOut(_)))
    ));
}

#[tokio::test]
async fn unknown_workflow_is_none() {
    let out = tempdir().unwrap();
    let scheduler = scheduler(Arc::new(SlowRunner::default()), out.path().to_path_buf(), vec![]);
    assert!(scheduler.trigger("missing", TS).await.is_none());
}

#[tokio::test]
async fn run_until_returns_on_shutdown() {
    let out = tempdir().unwrap();
    let runner = Arc::new(SlowRunner::default());
    let scheduler = scheduler(
        runner.clone(),
        out.path().to_path_buf(),
        vec![workflow("nb", Duration::from_secs(60))],
    );

    tokio::time::timeout(
        Duration::from_secs(5),
        scheduler.run_until(tokio::time::sleep(Duration::from_millis(20))),
    )
    .await
    .expect("scheduler should stop on shutdown");
    // @daily never fires within 20ms.
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
}
