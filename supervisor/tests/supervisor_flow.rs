//! End-to-end flows through the supervisor boundary.

use std::sync::Arc;

use build_supervisor::error::ErrorClass;
use build_supervisor::issues::BacklogStatus;
use build_supervisor::{
    AuditorRecommendation, AuditorResult, BuilderResult, BuilderVerdict, CiOutcome,
    GitVersionControl, InMemoryVcs, WorkspaceRetriever,
    IssueReport, IssueSource, JsonSummaryWriter, PhaseCounters, PhaseSpec, PhaseState,
    ProtectedPaths, RunConfig, RunState, Severity, Supervisor, SupervisorConfig, SupervisorError,
    TierSpec, TierState,
};

const PATCH: &str = "--- a/src/parser.rs\n+++ b/src/parser.rs\n@@ -1 +1 @@\n-old\n+new\n";
const PROTECTED_PATCH: &str =
    "--- a/secrets/prod.env\n+++ b/secrets/prod.env\n@@ -1 +1 @@\n-a\n+b\n";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn supervisor() -> Supervisor {
    init_tracing();
    Supervisor::in_memory(SupervisorConfig::default(), ["secrets"]).unwrap()
}

/// Two tiers: `t1` holds `p1`, `p2`; `t2` holds `p3`.
fn start_three_phase_run(sup: &Supervisor, run_id: &str) {
    sup.start_run(
        RunConfig::new(run_id),
        vec![TierSpec::new("t1", 0, "core"), TierSpec::new("t2", 1, "edges")],
        vec![
            PhaseSpec::new("p1", "t1", 0, "parser"),
            PhaseSpec::new("p2", "t1", 1, "lexer"),
            PhaseSpec::new("p3", "t2", 0, "cli"),
        ],
    )
    .unwrap();
}

fn minor(key: &str) -> IssueReport {
    IssueReport::new(key, Severity::Minor, IssueSource::Auditor, "style")
}

#[test]
fn test_recorded_minors_roll_up_to_tier_and_run() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    assert_eq!(sup.get_run("r1").unwrap().max_minor_issues_total, 9);

    sup.record_issue("r1", "p1", minor("unused-import")).unwrap();
    sup.record_issue("r1", "p1", minor("long-fn")).unwrap();

    let run = sup.get_run("r1").unwrap();
    assert_eq!(run.minor_issues_count, 2);
    assert_eq!(run.tier("t1").unwrap().minor_issues_count, 2);
    assert_eq!(run.tier("t2").unwrap().minor_issues_count, 0);
    assert_eq!(run.phase("p1").unwrap().minor_issues_count, 2);
    assert_eq!(run.phase("p2").unwrap().minor_issues_count, 0);
    assert_eq!(run.phase("p3").unwrap().minor_issues_count, 0);
}

#[test]
fn test_tier_counts_equal_sum_of_phases() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    sup.record_issue("r1", "p1", minor("a")).unwrap();
    sup.record_issue("r1", "p2", minor("b")).unwrap();
    sup.record_issue(
        "r1",
        "p3",
        IssueReport::new("c", Severity::Major, IssueSource::Ci, "tests"),
    )
    .unwrap();

    let run = sup.get_run("r1").unwrap();
    for tier in &run.tiers {
        let minor: u32 = run.phases_of(tier).map(|p| p.minor_issues_count).sum();
        let major: u32 = run.phases_of(tier).map(|p| p.major_issues_count).sum();
        assert_eq!(tier.minor_issues_count, minor);
        assert_eq!(tier.major_issues_count, major);
    }
    let minor: u32 = run.phases.iter().map(|p| p.minor_issues_count).sum();
    assert_eq!(run.minor_issues_count, minor);
    assert_eq!(run.major_issues_count, 1);
}

#[test]
fn test_same_key_twice_yields_one_run_entry() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    sup.record_issue("r1", "p1", minor("flaky").with_evidence("log-1"))
        .unwrap();
    let outcome = sup
        .record_issue("r1", "p1", minor("flaky").with_evidence("log-2"))
        .unwrap();

    assert_eq!(outcome.run_entry.occurrences, 2);
    assert_eq!(outcome.run_entry.evidence_refs, vec!["log-1", "log-2"]);
    assert_eq!(outcome.backlog_entry.occurrence_count, 2);
    assert_eq!(outcome.backlog_entry.age_in_runs, 1);

    let index = sup.run_issues("r1").unwrap();
    assert_eq!(index.len(), 1);
    let phase_entries = sup.phase_issues("r1", "p1").unwrap();
    assert_eq!(phase_entries.len(), 1);
    assert_eq!(phase_entries[0].occurrences, 2);
    // Counters follow distinct keys, not occurrences.
    assert_eq!(sup.get_run("r1").unwrap().minor_issues_count, 1);
}

#[test]
fn test_truncated_builder_escalates_tokens() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    assert_eq!(
        sup.get_run("r1").unwrap().phase("p1").unwrap().token_allocation,
        8_192
    );

    let result = BuilderResult::new(BuilderVerdict::Failed)
        .with_tokens(8_192)
        .truncated();
    let (_, state) = sup.submit_builder_result("r1", "p1", &result).unwrap();
    assert_eq!(state, PhaseState::Executing);

    let run = sup.get_run("r1").unwrap();
    assert_eq!(run.phase("p1").unwrap().token_allocation, 12_288);
    assert_eq!(run.token_escalations, 1);
    assert_eq!(run.tokens_used, 8_192);
}

#[test]
fn test_protected_patch_is_rejected_without_commit() {
    init_tracing();
    let vcs = Arc::new(InMemoryVcs::new());
    let sup = Supervisor::new(
        SupervisorConfig::default(),
        vcs.clone(),
        Arc::new(ProtectedPaths::new(["secrets"])),
    )
    .unwrap();
    start_three_phase_run(&sup, "r1");
    let line = sup.get_run("r1").unwrap().integration_line;
    let before = vcs.line_commits(&line).len();

    let result = BuilderResult::new(BuilderVerdict::Success).with_patch(PROTECTED_PATCH);
    let (commit, state) = sup.submit_builder_result("r1", "p1", &result).unwrap();

    assert!(commit.is_none());
    assert_ne!(state, PhaseState::Complete);
    assert_eq!(vcs.line_commits(&line).len(), before);
    let status = sup.integration_status("r1").unwrap();
    assert_eq!(status.rejected_patches, 1);
    assert!(status.phase_commits.is_empty());
}

fn git(dir: &std::path::Path, args: &[&str]) -> bool {
    std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Repository with `src/parser.rs` and `secrets/prod.env` committed, or
/// `None` when git is unavailable.
fn git_repo() -> Option<tempfile::TempDir> {
    let dir = tempfile::tempdir().unwrap();
    if !git(dir.path(), &["init", "--quiet"]) {
        return None;
    }
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::create_dir_all(dir.path().join("secrets")).unwrap();
    std::fs::write(dir.path().join("src/parser.rs"), "old\n").unwrap();
    std::fs::write(dir.path().join("secrets/prod.env"), "a\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(
        dir.path(),
        &["-c", "user.name=t", "-c", "user.email=t@t", "commit", "--quiet", "-m", "init"],
    );
    Some(dir)
}

fn git_supervisor(dir: &std::path::Path) -> Supervisor {
    let config = SupervisorConfig::default();
    let vcs = Arc::new(GitVersionControl::new(dir, config.git.clone()));
    Supervisor::new(config, vcs, Arc::new(ProtectedPaths::new(["secrets"]))).unwrap()
}

#[test]
fn test_git_backend_rejects_protected_and_commits_valid() {
    init_tracing();
    let Some(dir) = git_repo() else {
        return;
    };
    let sup = git_supervisor(dir.path());
    start_three_phase_run(&sup, "r1");
    let before = sup.integration_status("r1").unwrap().commits;

    let rejected = BuilderResult::new(BuilderVerdict::Success).with_patch(PROTECTED_PATCH);
    let (commit, state) = sup.submit_builder_result("r1", "p1", &rejected).unwrap();
    assert!(commit.is_none());
    assert_ne!(state, PhaseState::Complete);
    assert_eq!(sup.integration_status("r1").unwrap().commits, before);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("secrets/prod.env")).unwrap(),
        "a\n"
    );

    let accepted = BuilderResult::new(BuilderVerdict::Success).with_patch(PATCH);
    let (commit, state) = sup.submit_builder_result("r1", "p1", &accepted).unwrap();
    assert_eq!(state, PhaseState::Complete);
    let commits = sup.integration_status("r1").unwrap().commits;
    assert_eq!(commits.len(), before.len() + 1);
    assert_eq!(commits.last(), commit.as_ref());
}

#[test]
fn test_git_backend_rejects_protected_path_behind_any_prefix() {
    init_tracing();
    let Some(dir) = git_repo() else {
        return;
    };
    let sup = git_supervisor(dir.path());
    start_three_phase_run(&sup, "r1");
    let before = sup.integration_status("r1").unwrap().commits;

    let disguised = [
        "--- x/secrets/prod.env\n+++ y/secrets/prod.env\n@@ -1 +1 @@\n-a\n+pwned\n",
        "diff --git \"a/secrets/prod.env\" \"b/secrets/prod.env\"\n--- \"a/secrets/prod.env\"\n+++ \"b/secrets/prod.env\"\n@@ -1 +1 @@\n-a\n+pwned\n",
        "diff --git a/src/parser.rs b/secrets/parser.rs\nsimilarity index 100%\nrename from src/parser.rs\nrename to secrets/parser.rs\n",
    ];
    for patch in disguised {
        let result = BuilderResult::new(BuilderVerdict::Success).with_patch(patch);
        let (commit, state) = sup.submit_builder_result("r1", "p1", &result).unwrap();
        assert!(commit.is_none(), "committed: {}", patch);
        assert_ne!(state, PhaseState::Complete);
    }

    let status = sup.integration_status("r1").unwrap();
    assert_eq!(status.commits, before);
    assert_eq!(status.rejected_patches, disguised.len() as u32);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("secrets/prod.env")).unwrap(),
        "a\n"
    );
    assert!(!dir.path().join("secrets/parser.rs").exists());
}

#[test]
fn test_git_runs_do_not_share_commits() {
    init_tracing();
    let Some(dir) = git_repo() else {
        return;
    };
    let sup = git_supervisor(dir.path());
    start_three_phase_run(&sup, "r1");
    let base = sup.integration_status("r1").unwrap().commits;

    let result = BuilderResult::new(BuilderVerdict::Success).with_patch(PATCH);
    let (r1_commit, _) = sup.submit_builder_result("r1", "p1", &result).unwrap();
    let r1_commit = r1_commit.unwrap();

    start_three_phase_run(&sup, "r2");
    let r2_commits = sup.integration_status("r2").unwrap().commits;
    assert_eq!(r2_commits, base);
    assert!(!r2_commits.contains(&r1_commit));

    // The same patch applies cleanly to r2 because r2 starts from the base.
    let (r2_commit, state) = sup.submit_builder_result("r2", "p1", &result).unwrap();
    assert_eq!(state, PhaseState::Complete);
    assert_ne!(r2_commit, Some(r1_commit));
}

#[test]
fn test_valid_patch_lands_on_integration_line() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    let result = BuilderResult::new(BuilderVerdict::Success).with_patch(PATCH);
    let (commit, state) = sup.submit_builder_result("r1", "p1", &result).unwrap();

    let commit = commit.unwrap();
    assert_eq!(state, PhaseState::Complete);
    let status = sup.integration_status("r1").unwrap();
    assert_eq!(status.commits.last(), Some(&commit));
    assert_eq!(status.phase_commits["p1"], vec![commit]);
}

#[test]
fn test_major_issue_blocks_success() {
    let sup = supervisor();
    sup.start_run(
        RunConfig::new("r1"),
        vec![TierSpec::new("t1", 0, "core")],
        vec![PhaseSpec::new("p1", "t1", 0, "parser")],
    )
    .unwrap();
    sup.record_issue(
        "r1",
        "p1",
        IssueReport::new("data-race", Severity::Major, IssueSource::Auditor, "safety"),
    )
    .unwrap();

    let (_, state) = sup
        .submit_builder_result("r1", "p1", &BuilderResult::new(BuilderVerdict::Success))
        .unwrap();
    assert_eq!(state, PhaseState::Complete);

    let run = sup.get_run("r1").unwrap();
    assert_ne!(run.state, RunState::DoneSuccess);
    assert!(run.state.is_failure());
    assert_eq!(run.tiers[0].state, TierState::Failed);
    assert!(!run.promotion_eligible);
}

#[test]
fn test_first_single_file_failure_stays_in_stage_one() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    let result = BuilderResult::new(BuilderVerdict::Failed)
        .with_errors(["error[E0308]: mismatched types at src/parser.rs:42:9"]);
    sup.submit_builder_result("r1", "p1", &result).unwrap();

    let phase = sup.get_run("r1").unwrap().phase("p1").unwrap().clone();
    assert_eq!(phase.diagnostics.stage2_escalations, 0);
    assert_eq!(phase.diagnostics.stage1_retrievals, 1);
}

#[test]
fn test_multi_module_failure_escalates_to_stage_two() {
    let sup = supervisor();
    let mut rx = sup.subscribe_run("r1");
    start_three_phase_run(&sup, "r1");
    start_three_phase_run(&sup, "r2");
    let result = BuilderResult::new(BuilderVerdict::Failed).with_errors([
        "error: unresolved import at src/parser/mod.rs:3:5",
        "error: missing field at src/cli/args.rs:17:1",
    ]);
    sup.submit_builder_result("r1", "p1", &result).unwrap();

    let phase = sup.get_run("r1").unwrap().phase("p1").unwrap().clone();
    assert_eq!(phase.diagnostics.stage2_escalations, 1);
    assert_eq!(
        phase.diagnostics.last_trigger.as_deref(),
        Some("complex_pattern")
    );
    let events: Vec<_> = std::iter::from_fn(|| rx.try_next()).collect();
    assert!(events.iter().all(|e| e.run_id() == "r1"));
    assert!(events
        .iter()
        .any(|e| e.event_type() == "diagnostics_escalated"));
}

#[test]
fn test_stage_two_retrieval_is_capped_and_cited() {
    init_tracing();
    let repo = tempfile::tempdir().unwrap();
    let write = |rel: &str, body: &str| {
        let path = repo.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    };
    for i in 0..5 {
        write(
            &format!("src/parser/part{}.rs", i),
            &"fn parse_import() { /* unresolved import */ }\n".repeat(200),
        );
        write(&format!("tests/parser_{}.rs", i), "// unresolved import regression\n");
        write(&format!("docs/parser_{}.md", i), "Notes on the unresolved import.\n");
    }
    write("Cargo.toml", "[package]\n# import settings\n");

    let sup = Supervisor::in_memory(SupervisorConfig::default(), ["secrets"])
        .unwrap()
        .with_retriever(Arc::new(WorkspaceRetriever::new(repo.path())));
    start_three_phase_run(&sup, "r1");
    let result = BuilderResult::new(BuilderVerdict::Failed).with_errors([
        "error: unresolved import at src/parser/part0.rs:3:5",
        "error: unresolved import at src/cli/args.rs:17:1",
    ]);
    sup.submit_builder_result("r1", "p1", &result).unwrap();

    let phase = sup.get_run("r1").unwrap().phase("p1").unwrap().clone();
    let deep = &phase.diagnostics.deep_context;
    assert!(!deep.is_empty());
    assert!(deep.len() <= 12);
    for snippet in deep {
        assert!(snippet.line_count() <= 120);
        assert!(snippet.citation.start_line >= 1);
        assert!(snippet.citation.end_line >= snippet.citation.start_line);
    }
    for category in build_supervisor::diagnostics::RetrievalCategory::ALL {
        assert!(deep.iter().filter(|s| s.category == category).count() <= 3);
    }
}

#[test]
fn test_review_gate_and_ci_complete_run() {
    let sup = supervisor();
    sup.start_run(
        RunConfig::new("r1"),
        vec![TierSpec::new("t1", 0, "core")],
        vec![PhaseSpec::new("p1", "t1", 0, "parser")],
    )
    .unwrap();

    let review = BuilderResult::new(BuilderVerdict::NeedsReview).with_patch(PATCH);
    let (_, state) = sup.submit_builder_result("r1", "p1", &review).unwrap();
    assert_eq!(state, PhaseState::Gate);
    assert_eq!(sup.get_run("r1").unwrap().state, RunState::Gate);

    let state = sup
        .update_phase_status("r1", "p1", "CI_RUNNING", PhaseCounters::default())
        .unwrap();
    assert_eq!(state, PhaseState::CiRunning);
    assert_eq!(sup.get_run("r1").unwrap().state, RunState::CiRunning);

    let state = sup
        .report_ci_outcome("r1", "p1", &CiOutcome::Passed)
        .unwrap();
    assert_eq!(state, PhaseState::Complete);

    let summary = sup.run_summary("r1").unwrap();
    assert_eq!(summary.state, RunState::DoneSuccess);
    assert!(summary.promotion_eligible);
    assert!(summary.path.ends_with("SNAPSHOT_CREATED → DONE_SUCCESS"));
    assert_eq!(summary.commits, 1);
}

#[test]
fn test_auditor_approval_applies_patch() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    sup.submit_builder_result("r1", "p1", &BuilderResult::new(BuilderVerdict::NeedsReview))
        .unwrap();

    let approve = AuditorResult::new(AuditorRecommendation::Approve).with_patch(PATCH);
    let (commits, state) = sup.submit_auditor_result("r1", "p1", &approve).unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(state, PhaseState::Complete);
}

#[test]
fn test_token_cap_cancels_run() {
    let sup = supervisor();
    let mut config = RunConfig::new("r1");
    config.token_cap = Some(10_000);
    sup.start_run(
        config,
        vec![TierSpec::new("t1", 0, "core")],
        vec![
            PhaseSpec::new("p1", "t1", 0, "parser"),
            PhaseSpec::new("p2", "t1", 1, "lexer"),
        ],
    )
    .unwrap();

    let result = BuilderResult::new(BuilderVerdict::NeedsReview).with_tokens(12_000);
    let (_, state) = sup.submit_builder_result("r1", "p1", &result).unwrap();
    assert_eq!(state, PhaseState::Failed);

    let run = sup.get_run("r1").unwrap();
    assert_eq!(run.state, RunState::DoneFailedBudgetExhausted);
    assert!(run.failure_reason.as_deref().unwrap().contains("token cap"));
    assert_eq!(run.phase("p2").unwrap().state, PhaseState::Skipped);

    let analysis = sup.budget_analysis().unwrap();
    assert_eq!(analysis.budget_exhausted_runs, 1);

    let err = sup
        .update_phase_status("r1", "p2", "EXECUTING", PhaseCounters::default())
        .unwrap_err();
    assert!(matches!(err, SupervisorError::RunTerminal { .. }));
}

#[test]
fn test_phase_count_cap_cancels_run() {
    let sup = supervisor();
    let mut config = RunConfig::new("r1");
    config.max_phases = Some(1);
    sup.start_run(
        config,
        vec![TierSpec::new("t1", 0, "core")],
        vec![
            PhaseSpec::new("p1", "t1", 0, "parser"),
            PhaseSpec::new("p2", "t1", 1, "lexer"),
            PhaseSpec::new("p3", "t1", 2, "docs"),
        ],
    )
    .unwrap();

    let (_, state) = sup
        .submit_builder_result("r1", "p1", &BuilderResult::new(BuilderVerdict::Success))
        .unwrap();
    assert_eq!(state, PhaseState::Complete);
    assert!(!sup.get_run("r1").unwrap().is_terminal());

    let state = sup
        .update_phase_status("r1", "p2", "EXECUTING", PhaseCounters::default())
        .unwrap();
    assert_eq!(state, PhaseState::Failed);

    let run = sup.get_run("r1").unwrap();
    assert_eq!(run.state, RunState::DoneFailedBudgetExhausted);
    assert!(run.failure_reason.as_deref().unwrap().contains("phase-count cap"));
    assert_eq!(run.phase("p3").unwrap().state, PhaseState::Skipped);
    assert_eq!(run.tier("t1").unwrap().state, TierState::Failed);
}

#[test]
fn test_issue_on_completed_tier_blocks_success() {
    let sup = supervisor();
    sup.start_run(
        RunConfig::new("r1"),
        vec![TierSpec::new("t1", 0, "core"), TierSpec::new("t2", 1, "edges")],
        vec![
            PhaseSpec::new("p1", "t1", 0, "parser"),
            PhaseSpec::new("p2", "t2", 0, "cli"),
        ],
    )
    .unwrap();
    let success = BuilderResult::new(BuilderVerdict::Success);
    sup.submit_builder_result("r1", "p1", &success).unwrap();
    assert_eq!(
        sup.get_run("r1").unwrap().tier("t1").unwrap().state,
        TierState::Complete
    );

    sup.record_issue(
        "r1",
        "p1",
        IssueReport::new("late-regression", Severity::Major, IssueSource::Ci, "tests"),
    )
    .unwrap();
    sup.submit_builder_result("r1", "p2", &success).unwrap();

    let run = sup.get_run("r1").unwrap();
    let t1 = run.tier("t1").unwrap();
    assert_eq!(t1.major_issues_count, 1);
    assert!(t1.major_issues_count > t1.max_major_issues_tolerated);
    assert_eq!(run.state, RunState::DoneFailedRequiresHumanReview);
    assert!(!run.promotion_eligible);
}

#[test]
fn test_invalid_state_and_unknown_ids() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");

    let err = sup
        .update_phase_status("r1", "p1", "DONE", PhaseCounters::default())
        .unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidState { .. }));
    assert_eq!(
        sup.get_run("r1").unwrap().phase("p1").unwrap().state,
        PhaseState::Queued
    );

    let err = sup
        .update_phase_status("r1", "nope", "EXECUTING", PhaseCounters::default())
        .unwrap_err();
    assert!(matches!(err, SupervisorError::PhaseNotFound { .. }));

    let err = sup.record_issue("missing", "p1", minor("x")).unwrap_err();
    assert!(matches!(err, SupervisorError::RunNotFound { .. }));

    let err = sup.record_issue("r1", "nope", minor("x")).unwrap_err();
    assert!(matches!(err, SupervisorError::ScopeNotFound { .. }));
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert!(sup.run_issues("r1").unwrap().is_empty());
    assert_eq!(sup.get_run("r1").unwrap().minor_issues_count, 0);
}

#[test]
fn test_later_phase_cannot_jump_the_queue() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    let err = sup
        .update_phase_status("r1", "p3", "EXECUTING", PhaseCounters::default())
        .unwrap_err();
    assert!(matches!(err, SupervisorError::PhaseOrderViolation { .. }));
}

#[test]
fn test_backlog_ages_across_concurrent_runs() {
    init_tracing();
    let mut config = SupervisorConfig::default();
    config.aging.runs_threshold = Some(4);
    let sup = Arc::new(Supervisor::in_memory(config, ["secrets"]).unwrap());

    std::thread::scope(|scope| {
        for i in 0..8 {
            let sup = Arc::clone(&sup);
            scope.spawn(move || {
                let run_id = format!("run-{}", i);
                start_three_phase_run(&sup, &run_id);
                sup.record_issue(&run_id, "p1", minor("shared-lint")).unwrap();
                sup.record_issue(&run_id, "p3", minor("shared-lint")).unwrap();
            });
        }
    });

    let entry = sup.backlog().get("shared-lint").unwrap().unwrap();
    assert_eq!(entry.occurrence_count, 16);
    assert_eq!(entry.age_in_runs, 8);
    assert_eq!(entry.age_in_tiers, 16);
    assert_eq!(entry.status, BacklogStatus::NeedsCleanup);

    let summary = sup.issue_backlog_summary().unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.needs_cleanup, 1);

    let metrics = sup.run_metrics().unwrap();
    assert_eq!(metrics.total_runs, 8);
    assert_eq!(metrics.minor_issues, 16);
}

#[test]
fn test_summary_artifacts_track_committed_state() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::in_memory(SupervisorConfig::default(), ["secrets"])
        .unwrap()
        .with_summary_writer(Arc::new(JsonSummaryWriter::new(dir.path())));
    start_three_phase_run(&sup, "r1");
    sup.update_phase_status("r1", "p1", "EXECUTING", PhaseCounters::default())
        .unwrap();

    let read = |rel: &str| -> serde_json::Value {
        let content = std::fs::read_to_string(dir.path().join("r1").join(rel)).unwrap();
        serde_json::from_str(&content).unwrap()
    };
    assert_eq!(read("run_summary.json")["state"], "PHASE_EXECUTION");
    assert_eq!(read("phases/p1.json")["state"], "EXECUTING");
    assert_eq!(read("tiers/t1.json")["state"], "IN_PROGRESS");
    assert_eq!(read("phases/p3.json")["state"], "QUEUED");
    assert_eq!(sup.get_run("r1").unwrap().summary_write_failures, 0);
}

#[test]
fn test_tier_metrics_view() {
    let sup = supervisor();
    start_three_phase_run(&sup, "r1");
    sup.submit_builder_result("r1", "p1", &BuilderResult::new(BuilderVerdict::Success))
        .unwrap();

    let tiers = sup.tier_metrics("r1").unwrap();
    assert_eq!(tiers.len(), 2);
    assert_eq!(tiers[0].state, TierState::InProgress);
    assert_eq!(tiers[0].phases_by_state["COMPLETE"], 1);
    assert_eq!(tiers[1].state, TierState::Pending);
}
