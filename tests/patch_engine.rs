//! Patch engine against executable script targets named `claude`: probe
//! success, probe failure with rollback, and the post-launch fallback.
#![cfg(unix)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use claude_proxy::config::ConfigStore;
use claude_proxy::patch::history::PatchHistoryStore;
use claude_proxy::patch::spec::SpecSet;
use claude_proxy::patch::{PatchEngine, PatchOutcome};
use claude_proxy::run::{RunRequest, Runtime};
use claude_proxy::supervisor::Cancellation;

use common::write_script;

const POLICY_LINE: &str = "# if(a==='policySettings'){doWork(1,2);continue}";
const PATCHED_LINE: &str = "# if(a==='policySettings'){continue;   continue}";
const VERSION_LINE: &str = "2.1.0 (Claude Code)";
const MARKER: &str = "error: Module not found '/ @bun @bytecode @b'";

fn engine(state: &Path) -> PatchEngine {
    PatchEngine::new(
        "0.4.0",
        ConfigStore::in_dir(state),
        PatchHistoryStore::in_dir(state),
        SpecSet::builtin(),
    )
}

/// A `claude` whose `--version` works before and after patching.
fn healthy_cli(dir: &Path) -> PathBuf {
    let path = dir.join("claude");
    write_script(
        &path,
        &format!("{POLICY_LINE}\n[ \"$1\" = --version ] && echo '{VERSION_LINE}'\nexit 0"),
    );
    path
}

/// A `claude` whose `--version` breaks once the policy block is rewritten.
fn fragile_cli(dir: &Path) -> PathBuf {
    let path = dir.join("claude");
    write_script(
        &path,
        &format!(
            "{POLICY_LINE}\n\
             grep -q 'do''Work(1' \"$0\" || {{ echo \"{MARKER}\" >&2; exit 1; }}\n\
             [ \"$1\" = --version ] && echo '{VERSION_LINE}'\n\
             exit 0"
        ),
    );
    path
}

#[tokio::test]
async fn primary_target_is_patched_after_probe_passes() {
    let tmp = tempfile::tempdir().unwrap();
    let state = tmp.path().join("state");
    let cli = healthy_cli(tmp.path());
    let engine = engine(&state);

    let outcome = engine.maybe_patch_executable(&cli).await.unwrap();
    let backup = match outcome {
        PatchOutcome::Patched { backup, stats } => {
            assert_eq!(stats.replacements, 1);
            backup
        }
        other => panic!("unexpected outcome {other:?}"),
    };
    let text = fs::read_to_string(&cli).unwrap();
    assert!(text.contains(PATCHED_LINE), "{text}");
    assert!(fs::read_to_string(&backup).unwrap().contains(POLICY_LINE));

    let entry = engine
        .history()
        .latest_for(&fs::canonicalize(&cli).unwrap().to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(entry.backup_path.as_deref(), Some(backup.to_string_lossy().as_ref()));
    assert_eq!(
        engine.maybe_patch_executable(&cli).await.unwrap(),
        PatchOutcome::AlreadyPatched
    );
}

#[tokio::test]
async fn failing_probe_rolls_back_and_suppresses_retries() {
    let tmp = tempfile::tempdir().unwrap();
    let state = tmp.path().join("state");
    let cli = fragile_cli(tmp.path());
    let original = fs::read(&cli).unwrap();
    let engine = engine(&state);

    let outcome = engine.maybe_patch_executable(&cli).await.unwrap();
    match &outcome {
        PatchOutcome::RolledBack { reason } => assert!(reason.contains("Module not found"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(fs::read(&cli).unwrap(), original);
    assert!(!tmp.path().join("claude.claude-proxy.bak").exists());
    assert!(engine.history().load().unwrap().entries.is_empty());

    let cfg = ConfigStore::in_dir(&state).load().unwrap();
    assert_eq!(cfg.patch_failures.len(), 1);
    let failure = &cfg.patch_failures[0];
    assert_eq!(failure.proxy_version, "0.4.0");
    assert_eq!(failure.claude_version.as_deref(), Some("2.1.0"));
    assert!(failure.reason.len() <= 240);

    let again = engine.maybe_patch_executable(&cli).await.unwrap();
    assert!(matches!(again, PatchOutcome::Skipped { .. }), "{again:?}");
    assert_eq!(fs::read(&cli).unwrap(), original);
}

#[tokio::test]
async fn launch_failure_with_marker_restores_and_relaunches() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let state = dir.join("state");
    let cli = dir.join("claude");
    let launches = dir.join("launches");
    let probe_ok = dir.join("probe-ok");
    fs::write(&probe_ok, "").unwrap();

    // Original bytes run fine. Patched bytes pass `--version` while
    // `probe-ok` exists, then fail at launch and break every later probe.
    write_script(
        &cli,
        &format!(
            "{POLICY_LINE}\n\
             if grep -q 'do''Work(1' \"$0\"; then\n\
               [ \"$1\" = --version ] && {{ echo '{VERSION_LINE}'; exit 0; }}\n\
               echo original >> '{launches}'; exit 0\n\
             fi\n\
             if [ \"$1\" = --version ]; then\n\
               [ -f '{probe_ok}' ] && {{ echo '{VERSION_LINE}'; exit 0; }}\n\
               echo \"{MARKER}\" >&2; exit 1\n\
             fi\n\
             echo patched >> '{launches}'; rm -f '{probe_ok}'; exit 1",
            launches = launches.display(),
            probe_ok = probe_ok.display(),
        ),
    );

    let rt = Runtime::in_dir(&state);
    rt.set_proxy_enabled(false).unwrap();
    let request = RunRequest {
        claude: Some(cli.clone()),
        ..RunRequest::default()
    };
    let status = rt.run(request, &Cancellation::never()).await.unwrap();

    assert!(status.success());
    assert_eq!(fs::read_to_string(&launches).unwrap(), "patched\noriginal\n");
    assert!(fs::read_to_string(&cli).unwrap().contains(POLICY_LINE));
    assert!(rt.patch_engine().history().load().unwrap().entries.is_empty());
    assert!(!dir.join("claude.claude-proxy.bak").exists());

    let cfg = rt.store().load().unwrap();
    assert_eq!(cfg.patch_failures.len(), 1);
    assert_eq!(cfg.patch_failures[0].claude_version.as_deref(), Some("2.1.0"));
    assert!(cfg.patch_failures[0].reason.contains("Module not found"));

    // the ledger keeps the next launch on the original bytes
    let request = RunRequest {
        claude: Some(cli.clone()),
        ..RunRequest::default()
    };
    let status = rt.run(request, &Cancellation::never()).await.unwrap();
    assert!(status.success());
    assert_eq!(fs::read_to_string(&launches).unwrap(), "patched\noriginal\noriginal\n");
    assert!(fs::read_to_string(&cli).unwrap().contains(POLICY_LINE));
}
