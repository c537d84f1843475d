//! Integration tests for strata
//!
//! These drive the binary end to end over a throwaway workspace, plus one
//! library-level run through the orchestrator.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn strata() -> Command {
    let mut cmd = cargo_bin_cmd!("strata");
    for var in [
        "STRATA_LOG",
        "STRATA_TOKEN_BUDGET",
        "STRATA_SIZE_CLASS",
        "STRATA_INDEX_ENDPOINT",
        "STRATA_CODEBASE_DIR",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Workspace with a small legacy Java codebase under `codebase/`.
fn create_workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let code = dir.path().join("codebase/src/main/java/com/acme");
    fs::create_dir_all(&code).unwrap();
    fs::write(
        code.join("App.java"),
        "package com.acme;\n\nimport org.springframework.boot.SpringApplication;\n\npublic class App {}\n",
    )
    .unwrap();
    fs::write(
        code.join("OrderService.java"),
        "package com.acme;\n\npublic class OrderService {\n    // discount rule: 10% over 100 units\n}\n",
    )
    .unwrap();
    fs::write(dir.path().join("codebase/pom.xml"), "<project><artifactId>acme</artifactId></project>\n")
        .unwrap();
    dir
}

fn write_phases(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

const SURVEY_PHASES: &str = r#"
phases:
  - label: discovery
    stages:
      - id: inventory
        queries:
          - search_term: springframework
          - file_path: pom.xml
        forward_to: [security]
  - label: analysis
    parallel: true
    depends_on: [discovery]
    stages:
      - id: security
        queries:
          - pattern: "*.java"
      - id: frontend
        requires:
          pattern: "*.tsx"
"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_strata_help() {
        strata()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("resolve"));
    }

    #[test]
    fn test_strata_version() {
        strata().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_size_class_rejected() {
        let dir = create_workspace();
        let phases = write_phases(dir.path(), "phases.yaml", SURVEY_PHASES);
        strata()
            .current_dir(dir.path())
            .args(["run", phases.to_str().unwrap(), "--size-class", "tiny"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("tiny"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_show_validate() {
        let dir = TempDir::new().unwrap();

        strata()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created strata.toml"));
        assert!(dir.path().join(".strata/strata.toml").exists());

        strata()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        strata()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[orchestrator]"))
            .stdout(predicate::str::contains("grace_period_secs = 30"));

        strata()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_warns() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".strata")).unwrap();
        fs::write(
            dir.path().join(".strata/strata.toml"),
            "[index]\nendpoint = \"localhost:9121\"\n",
        )
        .unwrap();

        strata()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("not an http(s) URL"));
    }

    #[test]
    fn test_env_override_shown() {
        let dir = TempDir::new().unwrap();
        strata()
            .current_dir(dir.path())
            .env("STRATA_TOKEN_BUDGET", "5000")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("STRATA_TOKEN_BUDGET"))
            .stdout(predicate::str::contains("limit = 5000"));
    }
}

// =============================================================================
// Plan validation
// =============================================================================

mod plan {
    use super::*;

    #[test]
    fn test_plan_prints_order() {
        let dir = create_workspace();
        let phases = write_phases(dir.path(), "phases.yaml", SURVEY_PHASES);
        strata()
            .current_dir(dir.path())
            .args(["plan", phases.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("1. discovery (sequential)"))
            .stdout(predicate::str::contains("2. analysis (parallel) after discovery"))
            .stdout(predicate::str::contains("Plan is valid: 2 phases, 3 stages."));
    }

    #[test]
    fn test_plan_rejects_cycle() {
        let dir = TempDir::new().unwrap();
        let phases = write_phases(
            dir.path(),
            "phases.json",
            r#"{"phases":[
                {"label":"a","depends_on":["b"],"stages":[{"id":"s1"}]},
                {"label":"b","depends_on":["a"],"stages":[{"id":"s2"}]}
            ]}"#,
        );
        strata()
            .current_dir(dir.path())
            .args(["plan", phases.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cycle"));
    }

    #[test]
    fn test_plan_rejects_backward_recommendation() {
        let dir = TempDir::new().unwrap();
        let phases = write_phases(
            dir.path(),
            "phases.yaml",
            r#"
phases:
  - label: first
    stages:
      - id: early
  - label: second
    depends_on: [first]
    stages:
      - id: late
        forward_to: [early]
"#,
        );
        strata()
            .current_dir(dir.path())
            .args(["plan", phases.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not in a later phase"));
    }
}

// =============================================================================
// Runs
// =============================================================================

mod run {
    use super::*;

    #[test]
    fn test_survey_run_writes_documents_and_logs() {
        let dir = create_workspace();
        let phases = write_phases(dir.path(), "phases.yaml", SURVEY_PHASES);

        strata()
            .current_dir(dir.path())
            .args(["run", phases.to_str().unwrap(), "--size-class", "small"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"))
            .stdout(predicate::str::contains("2 done, 1 skipped, 0 failed"));

        let context = dir.path().join("output/context");
        assert!(context.join("inventory-summary.json").exists());
        assert!(context.join("security-summary.json").exists());
        assert!(!context.join("frontend-summary.json").exists());

        let inventory: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(context.join("inventory-summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(inventory["outcome"], "completed");
        assert_eq!(inventory["data"]["resolutions"][0]["tier"], "raw");
        assert!(inventory["summary"]["forward_recommendations"]["security"].is_array());

        let reports = dir.path().join("output/reports");
        let access_log = fs::read_to_string(reports.join("data-access-log.jsonl")).unwrap();
        assert!(access_log.lines().count() >= 3);
        let totals: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(reports.join("token-usage-log.json")).unwrap())
                .unwrap();
        assert_eq!(totals["size_class"], "small");
        assert_eq!(totals["limit"], 175_000);
        assert!(totals["consumed"].as_u64().unwrap() > 0);

        assert!(dir.path().join(".strata/run.json").exists());
        assert!(dir.path().join("output/logs/strata.log").exists());

        strata()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"))
            .stdout(predicate::str::contains("inventory"))
            .stdout(predicate::str::contains("Context documents"));
    }

    #[test]
    fn test_command_stages_skip_and_fail_without_stopping_run() {
        let dir = create_workspace();
        let phases = write_phases(
            dir.path(),
            "phases.yaml",
            r#"
phases:
  - label: agents
    parallel: true
    stages:
      - id: not-applicable
        command: "echo 'no frontend found' >&2; exit 2"
      - id: broken
        command: "echo 'parser crashed' >&2; exit 5"
      - id: reporter
        command: "cat > /dev/null; echo '{\"summary\":{\"key_findings\":[\"uses struts\"]}}'"
"#,
        );

        strata()
            .current_dir(dir.path())
            .args(["run", phases.to_str().unwrap(), "--size-class", "small"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 done, 1 skipped, 1 failed"));

        let context = dir.path().join("output/context");
        assert!(!context.join("not-applicable-summary.json").exists());
        let broken = fs::read_to_string(context.join("broken-summary.json")).unwrap();
        assert!(broken.contains("\"failed\""));
        assert!(broken.contains("parser crashed"));
        let reporter = fs::read_to_string(context.join("reporter-summary.json")).unwrap();
        assert!(reporter.contains("uses struts"));
    }

    #[test]
    fn test_exhausted_budget_skips_later_phases() {
        let dir = create_workspace();
        fs::create_dir_all(dir.path().join(".strata")).unwrap();
        fs::write(dir.path().join(".strata/strata.toml"), "[budget]\nlimit = 5\n").unwrap();
        let phases = write_phases(dir.path(), "phases.yaml", SURVEY_PHASES);

        strata()
            .current_dir(dir.path())
            .args(["run", phases.to_str().unwrap(), "--size-class", "small"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 done, 2 skipped"))
            .stdout(predicate::str::contains("exhausted"));

        let inventory =
            fs::read_to_string(dir.path().join("output/context/inventory-summary.json")).unwrap();
        assert!(inventory.contains("budget exhausted"));
    }

    #[test]
    fn test_missing_phases_file_fails() {
        let dir = create_workspace();
        strata()
            .current_dir(dir.path())
            .args(["run", "nope.yaml", "--size-class", "small"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope.yaml"));
    }

    #[test]
    fn test_status_without_run() {
        let dir = TempDir::new().unwrap();
        strata()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No run recorded"));
    }

    #[test]
    fn test_abort_writes_signal_file() {
        let dir = TempDir::new().unwrap();
        strata()
            .current_dir(dir.path())
            .arg("abort")
            .assert()
            .success()
            .stdout(predicate::str::contains("Abort signal sent."));
        assert!(dir.path().join(".strata/abort").exists());
    }
}

// =============================================================================
// Ad-hoc resolution
// =============================================================================

mod resolve {
    use super::*;

    #[test]
    fn test_resolve_falls_back_to_raw() {
        let dir = create_workspace();
        strata()
            .current_dir(dir.path())
            .args(["resolve", "--search", "discount rule"])
            .assert()
            .success()
            .stdout(predicate::str::contains("tier: raw"))
            .stdout(predicate::str::contains("src/main/java/com/acme/OrderService.java"))
            .stdout(predicate::str::contains("App.java").not());
    }

    #[test]
    fn test_resolve_prefers_digest() {
        let dir = create_workspace();
        let reports = dir.path().join("output/reports");
        fs::create_dir_all(&reports).unwrap();
        fs::write(
            reports.join("repomix-summary.md"),
            "Total lines: 12\n\n## Services\nOrderService applies the discount rule at checkout\n",
        )
        .unwrap();

        strata()
            .current_dir(dir.path())
            .args(["resolve", "--search", "discount rule"])
            .assert()
            .success()
            .stdout(predicate::str::contains("tier: compressed"))
            .stdout(predicate::str::contains("applies the discount rule at checkout"));
    }

    const TWO_FILE_DIGEST: &str = "\
Total lines: 12

## File: pom.xml
```xml
<project><artifactId>acme</artifactId></project>
```

## File: src/main/java/com/acme/OrderService.java
```java
public class OrderService { /* digest copy */ }
```
";

    fn write_digest(dir: &Path, content: &str) {
        let reports = dir.join("output/reports");
        fs::create_dir_all(&reports).unwrap();
        fs::write(reports.join("repomix-summary.md"), content).unwrap();
    }

    #[test]
    fn test_resolve_later_digest_file_from_compressed() {
        let dir = create_workspace();
        write_digest(dir.path(), TWO_FILE_DIGEST);

        strata()
            .current_dir(dir.path())
            .args(["resolve", "--file", "src/main/java/com/acme/OrderService.java"])
            .assert()
            .success()
            .stdout(predicate::str::contains("tier: compressed"))
            .stdout(predicate::str::contains("digest copy"))
            .stdout(predicate::str::contains("artifactId").not());
    }

    #[test]
    fn test_resolve_every_field_missing_from_digest_falls_to_raw() {
        let dir = create_workspace();
        write_digest(dir.path(), TWO_FILE_DIGEST);

        strata()
            .current_dir(dir.path())
            .args([
                "resolve",
                "--file",
                "src/main/java/com/acme/App.java",
                "--pattern",
                "*.gradle",
                "--search",
                "kafka",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("tier: raw"))
            .stdout(predicate::str::contains("SpringApplication"));
    }

    #[test]
    fn test_resolve_requires_a_query() {
        let dir = create_workspace();
        strata()
            .current_dir(dir.path())
            .arg("resolve")
            .assert()
            .failure();
    }

    #[test]
    fn test_size_reports_small_codebase() {
        let dir = create_workspace();
        strata()
            .current_dir(dir.path())
            .arg("size")
            .assert()
            .success()
            .stdout(predicate::str::contains("size class: small"))
            .stdout(predicate::str::contains("limit:      175000"));
    }
}

// =============================================================================
// Library API
// =============================================================================

mod library {
    use super::*;
    use strata::budget::ProjectSizeClass;
    use strata::config::{CliOverrides, Config};
    use strata::context::ContextStore;
    use strata::pipeline::{Orchestrator, PhasePlan, PhasesFile, RunOptions, RunState};
    use strata::stages::builtin_registry;
    use strata::strata_config::StrataConfig;
    use strata_common::{SourceTier, StageId};

    #[tokio::test]
    async fn test_orchestrated_survey_run() {
        let dir = create_workspace();
        let config = Config::from_parts(
            dir.path().to_path_buf(),
            StrataConfig::default(),
            CliOverrides::default(),
        );
        let plan = PhasePlan::new(PhasesFile::parse_yaml(SURVEY_PHASES).unwrap().phases).unwrap();
        let registry = builtin_registry(&plan, dir.path());

        let report = Orchestrator::new(config.clone(), plan, registry)
            .run(RunOptions::new(ProjectSizeClass::Small, 175_000))
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.exit_code(), 0);
        assert!(report.budget.by_tier[&SourceTier::Raw].attempts >= 3);

        let store = ContextStore::open(&config.context_dir, &report.run_id).unwrap();
        let docs = store.read_all().unwrap();
        assert_eq!(docs.len(), 2);
        let security = &docs[&StageId::new("security").unwrap()];
        assert!(security.usage.total > 0);
    }
}
