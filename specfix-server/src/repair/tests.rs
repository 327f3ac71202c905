use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::build_farm::BuildStatus;
use crate::fakes::{claimed_request, FakeAnalyzer, FakeFarm, FakeHosting, FORK_URL};
use crate::store::TerminalStatus;

fn settings(max_retries: u32) -> RepairSettings {
    RepairSettings {
        max_retries,
        poll_interval: Duration::from_secs(30),
        build_timeout: Duration::from_secs(300),
        repair_project: "specfix-repair".to_string(),
        pr_project_template: None,
    }
}

fn machine(
    farm: &Arc<FakeFarm>,
    analyzer: &Arc<FakeAnalyzer>,
    settings: RepairSettings,
) -> RepairMachine {
    RepairMachine::new(farm.clone(), analyzer.clone(), settings)
}

fn explanations(comments: &[String]) -> usize {
    comments
        .iter()
        .filter(|c| c.contains("fix for attempt"))
        .count()
}

#[tokio::test(start_paused = true)]
async fn first_build_passes() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([BuildStatus::Passed]));
    let analyzer = Arc::new(FakeAnalyzer::default());
    let request = claimed_request(1);

    let outcome = machine(&farm, &analyzer, settings(3))
        .run(&hosting, &request, &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Succeeded { attempts: 1 });
    assert_eq!(outcome.terminal_status(), Some(TerminalStatus::Completed));
    assert_eq!(farm.builds(), 1);
    assert_eq!(farm.registrations.load(Ordering::SeqCst), 1);

    let pushes = hosting.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "zlib.spec");
    assert_eq!(pushes[0].1, request.recipe_content);
    assert_eq!(pushes[0].2, "specfix-pr-7");

    let comments = hosting.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains(&format!("{}/commit/{:040}", FORK_URL, 1)));
    assert!(comments[0].contains("https://farm.test/specfix-repair/zlib?job=job-b-1"));
    assert!(analyzer.fixes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fails_twice_then_passes() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([
        BuildStatus::Failed,
        BuildStatus::Failed,
        BuildStatus::Passed,
    ]));
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(2))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Succeeded { attempts: 3 });
    assert_eq!(farm.builds(), 3);
    assert_eq!(farm.registrations.load(Ordering::SeqCst), 1);

    let comments = hosting.comments();
    assert_eq!(comments.len(), 3);
    assert_eq!(explanations(&comments), 2);
    assert!(comments[2].contains("the build passed"));

    // Each fix starts from the previous attempt's recipe.
    let pushes = hosting.pushes();
    assert!(pushes[2].1.ends_with("# fix 1\n# fix 2"));
}

#[tokio::test(start_paused = true)]
async fn exhaustion_files_diagnostic_issue() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(
        FakeFarm::with_statuses([BuildStatus::Failed, BuildStatus::Failed]).with_log(
            "Installing build dependencies\nNo matching package to install: 'perl(IPC::Cmd)'\nerror: build failed",
        ),
    );
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(1))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Exhausted { attempts: 2 });
    assert_eq!(outcome.terminal_status(), Some(TerminalStatus::Failed));
    assert_eq!(farm.builds(), 2);

    let comments = hosting.comments();
    assert_eq!(explanations(&comments), 1);
    assert!(comments
        .last()
        .unwrap()
        .contains("still fails after 1 repair attempt"));

    assert_eq!(
        analyzer.diagnoses(),
        vec![vec![
            "No matching package to install: 'perl(IPC::Cmd)'".to_string()
        ]]
    );
    assert_eq!(hosting.issues().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_notice_links_the_last_job() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([
        BuildStatus::Failed,
        BuildStatus::Failed,
    ]));
    let analyzer = Arc::new(FakeAnalyzer::default());

    machine(&farm, &analyzer, settings(1))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    let last = hosting.comments().pop().unwrap();
    assert!(last.contains("https://farm.test/specfix-repair/zlib?job=job-b-2"));
}

#[tokio::test(start_paused = true)]
async fn unresolved_job_links_the_package_builds() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([BuildStatus::Passed]).without_jobs());
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(1))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Succeeded { attempts: 1 });
    let comments = hosting.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].ends_with("Build report: https://farm.test/specfix-repair/zlib"));
}

#[tokio::test(start_paused = true)]
async fn clean_final_log_files_no_issue() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([BuildStatus::Failed]));
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(0))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Exhausted { attempts: 1 });
    assert!(analyzer.diagnoses().is_empty());
    assert!(hosting.issues().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failing_issue_creation_keeps_exhausted() {
    let hosting = FakeHosting {
        fail_issues: true,
        ..FakeHosting::default()
    };
    let farm = Arc::new(
        FakeFarm::with_statuses([BuildStatus::Failed])
            .with_log("package perl-devel is not installed"),
    );
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(0))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Exhausted { attempts: 1 });
    assert_eq!(analyzer.diagnoses().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_timeout_counts_as_failure() {
    let hosting = FakeHosting::default();
    // No verdict ever arrives.
    let farm = Arc::new(FakeFarm::with_statuses([]));
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(1))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Exhausted { attempts: 2 });
    assert_eq!(farm.builds(), 2);
    assert_eq!(analyzer.fixes().len(), 1);
    // 300s timeout polled every 30s, for each of the two builds.
    assert_eq!(farm.polls.load(Ordering::SeqCst), 20);
}

#[tokio::test(start_paused = true)]
async fn zero_retries_never_submits_a_second_build() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([
        BuildStatus::Failed,
        BuildStatus::Passed,
    ]));
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(0))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Exhausted { attempts: 1 });
    assert_eq!(farm.builds(), 1);
    assert!(analyzer.fixes().is_empty());
    let comments = hosting.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("0 repair attempts"));
}

#[tokio::test(start_paused = true)]
async fn adapter_error_is_reported_and_fails() {
    let hosting = FakeHosting {
        fail_push: true,
        ..FakeHosting::default()
    };
    let farm = Arc::new(FakeFarm::with_statuses([BuildStatus::Passed]));
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(3))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert!(matches!(outcome, RepairOutcome::Erred { .. }));
    assert_eq!(outcome.terminal_status(), Some(TerminalStatus::Failed));
    assert_eq!(farm.builds(), 0);
    let comments = hosting.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("push rejected"));
}

#[tokio::test(start_paused = true)]
async fn analysis_error_after_failure_is_erred() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([BuildStatus::Failed]));
    let analyzer = Arc::new(FakeAnalyzer {
        fail_fix: true,
        ..FakeAnalyzer::default()
    });

    let outcome = machine(&farm, &analyzer, settings(2))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert!(matches!(outcome, RepairOutcome::Erred { .. }));
    assert_eq!(farm.builds(), 1);
}

#[tokio::test(start_paused = true)]
async fn comment_failures_do_not_change_outcome() {
    let hosting = FakeHosting {
        fail_comments: true,
        ..FakeHosting::default()
    };
    let farm = Arc::new(FakeFarm::with_statuses([BuildStatus::Passed]));
    let analyzer = Arc::new(FakeAnalyzer::default());

    let outcome = machine(&farm, &analyzer, settings(3))
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Succeeded { attempts: 1 });
}

#[tokio::test(start_paused = true)]
async fn initial_analysis_uses_pull_request_build() {
    let hosting = FakeHosting {
        pr_files: vec!["zlib.spec".to_string(), "zlib-1.3.tar.gz".to_string()],
        ..FakeHosting::default()
    };
    let farm = Arc::new(FakeFarm::with_statuses([BuildStatus::Passed]));
    let analyzer = Arc::new(FakeAnalyzer::default());
    let mut settings = settings(3);
    settings.pr_project_template = Some("pr-{repo}-{pr_number}".to_string());

    let outcome = machine(&farm, &analyzer, settings)
        .run(&hosting, &claimed_request(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome, RepairOutcome::Succeeded { attempts: 1 });
    assert_eq!(
        *farm.latest_log_requests.lock().unwrap(),
        vec![("pr-zlib-7".to_string(), "zlib".to_string())]
    );
    assert_eq!(
        analyzer.fixes()[0].1.as_deref(),
        Some("zlib.spec\nzlib-1.3.tar.gz")
    );
    assert!(hosting.pushes()[0].1.ends_with("# fix 1"));

    let comments = hosting.comments();
    assert_eq!(comments.len(), 2);
    assert!(comments[0].contains("fix for attempt 0"));
}

#[tokio::test(start_paused = true)]
async fn interrupt_before_submit_reports_nothing() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([BuildStatus::Passed]));
    let analyzer = Arc::new(FakeAnalyzer::default());
    let interrupt = CancellationToken::new();
    interrupt.cancel();

    let outcome = machine(&farm, &analyzer, settings(3))
        .run(&hosting, &claimed_request(1), &interrupt)
        .await;

    assert_eq!(outcome, RepairOutcome::Interrupted);
    assert_eq!(outcome.terminal_status(), None);
    assert_eq!(farm.builds(), 0);
    assert!(hosting.comments().is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_wait_stops_at_the_sleep() {
    let hosting = FakeHosting::default();
    let farm = Arc::new(FakeFarm::with_statuses([]));
    let analyzer = Arc::new(FakeAnalyzer::default());
    let interrupt = CancellationToken::new();

    let canceller = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(45)).await;
        canceller.cancel();
    });

    let outcome = machine(&farm, &analyzer, settings(3))
        .run(&hosting, &claimed_request(1), &interrupt)
        .await;

    assert_eq!(outcome, RepairOutcome::Interrupted);
    assert_eq!(farm.builds(), 1);
    assert_eq!(farm.polls.load(Ordering::SeqCst), 1);
    assert!(hosting.comments().is_empty());
}

fn status_strategy() -> impl Strategy<Value = BuildStatus> {
    prop_oneof![
        Just(BuildStatus::Passed),
        Just(BuildStatus::Failed),
        Just(BuildStatus::Unknown),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn attempts_are_bounded_and_one_outcome_is_reported(
        max_retries in 0u32..4,
        statuses in prop::collection::vec(status_strategy(), 0..16),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let hosting = FakeHosting::default();
        let farm = Arc::new(FakeFarm::with_statuses(statuses));
        let analyzer = Arc::new(FakeAnalyzer::default());
        let settings = RepairSettings {
            max_retries,
            poll_interval: Duration::from_secs(1),
            build_timeout: Duration::from_secs(3),
            repair_project: "specfix-repair".to_string(),
            pr_project_template: None,
        };

        let outcome = runtime.block_on(
            machine(&farm, &analyzer, settings)
                .run(&hosting, &claimed_request(1), &CancellationToken::new()),
        );

        prop_assert!(farm.builds() <= max_retries + 1);
        match outcome {
            RepairOutcome::Succeeded { attempts } | RepairOutcome::Exhausted { attempts } => {
                prop_assert_eq!(attempts, farm.builds());
            }
            other => prop_assert!(false, "unexpected outcome {:?}", other),
        }

        let comments = hosting.comments();
        prop_assert_eq!(comments.len() - explanations(&comments), 1);
    }
}
