use std::path::Path;

use colored::Colorize;
use serde::Serialize;

use crate::checker::{CheckReport, RecoveryOutcome, Verdict};
use crate::config::RunConfig;
use crate::error::Error;
use crate::history::History;
use crate::orchestrator::RunOutcome;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

pub fn print_banner(title: &str) {
    println!();
    println!("{}", RULE.bold());
    println!("{}", title.bold());
    println!("{}", RULE.bold());
}

/// Print one line per fault window, then the verdict.
pub fn print_outcome(config: &RunConfig, outcome: &RunOutcome) {
    let report = &outcome.report;
    println!(
        "\n  {} {} / {}",
        "▸".dimmed(),
        config.nemesis_gen.bold(),
        config.client_gen.name().bold()
    );
    println!(
        "    {} polls ({} healthy), {} faults, {:.0}s",
        report.health_samples,
        report.healthy_samples,
        report.faults,
        outcome.elapsed.as_secs_f64()
    );

    for record in &report.recoveries {
        let window = record.window;
        match record.outcome {
            RecoveryOutcome::Recovered { .. } => println!(
                "    {} fault at {:.1}s: recovered after {:.1}s",
                "✓".green(),
                window.fault_end.as_secs_f64(),
                record.recovery_time().unwrap_or_default().as_secs_f64()
            ),
            RecoveryOutcome::Superseded => println!(
                "    {} fault at {:.1}s: superseded by a later fault",
                "·".dimmed(),
                window.fault_end.as_secs_f64()
            ),
            RecoveryOutcome::Cancelled => println!(
                "    {} fault at {:.1}s: job cancelled",
                "·".dimmed(),
                window.fault_end.as_secs_f64()
            ),
            RecoveryOutcome::Violated | RecoveryOutcome::Pending => println!(
                "    {} fault at {:.1}s: {}",
                "✗".red(),
                window.fault_end.as_secs_f64(),
                format!("no recovery within {window}").red()
            ),
        }
    }
    if !report.complete {
        println!("    {} history has operations that never completed", "!".yellow());
    }

    println!();
    println!("{}", RULE.bold());
    match report.verdict {
        Verdict::Pass => {
            println!("{}", format!("📊 RESULT: {}", report.verdict).green().bold())
        }
        Verdict::Fail { .. } => {
            println!("{}", format!("📊 RESULT: {}", report.verdict).red().bold())
        }
    }
    println!("{}", RULE.bold());
    println!();
}

#[derive(Serialize)]
struct Results<'a> {
    config: &'a RunConfig,
    verdict: &'a Verdict,
    report: &'a CheckReport,
    timed_out: bool,
    history: &'a History,
}

pub fn write_results(path: &Path, config: &RunConfig, outcome: &RunOutcome) -> Result<(), Error> {
    let results = Results {
        config,
        verdict: &outcome.report.verdict,
        report: &outcome.report,
        timed_out: outcome.timed_out,
        history: &outcome.history,
    };
    let output_error = |reason: String| Error::Output {
        path: path.to_path_buf(),
        reason,
    };
    let json = serde_json::to_string_pretty(&results).map_err(|e| output_error(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| output_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{RecoveryChecker, RecoveryParams};
    use crate::generator::ClientGen;
    use crate::history::{Action, FaultAction, Operation, Process};
    use crate::test_spec::TestSpec;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config() -> RunConfig {
        RunConfig {
            test_spec_path: PathBuf::from("spec.json"),
            test_spec: TestSpec {
                dbs: vec!["zookeeper".into()],
                job: None,
            },
            ha_storage_dir: "/ha".into(),
            nemesis_gen: "kill-task-managers".into(),
            client_gen: ClientGen::PollJobRunning,
            recovery: RecoveryParams {
                healthy_threshold: 1,
                grace_period: Duration::from_secs(60),
            },
            poll_interval: Duration::from_secs(5),
            cancel_after: Duration::from_secs(15),
            time_limit: Duration::from_secs(30),
            url: "http://localhost:8081".into(),
            control_url: "http://localhost:8090".into(),
            out: None,
        }
    }

    fn outcome(config: &RunConfig) -> RunOutcome {
        let kill = Action::Fault(FaultAction::KillTaskManagers);
        let history = History::from_ops(vec![
            Operation::invoke(Process::Nemesis, kill, Duration::from_secs(1)),
            Operation::ok(Process::Nemesis, kill, Duration::from_secs(2), None),
            Operation::invoke(Process::Client, Action::PollRunning, Duration::from_secs(5)),
            Operation::ok(
                Process::Client,
                Action::PollRunning,
                Duration::from_secs(5),
                Some(serde_json::json!(true)),
            ),
        ]);
        let report = RecoveryChecker::new(config.recovery).check(&history);
        RunOutcome {
            history,
            report,
            timed_out: false,
            elapsed: Duration::from_secs(6),
        }
    }

    #[test]
    fn results_file_has_verdict_and_history() {
        let config = config();
        let outcome = outcome(&config);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");

        write_results(&path, &config, &outcome).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["verdict"]["result"], "pass");
        assert_eq!(written["report"]["faults"], 1);
        assert_eq!(written["report"]["recoveries"][0]["outcome"], "recovered");
        assert_eq!(written["history"].as_array().map(Vec::len), Some(4));
        assert_eq!(written["config"]["nemesis_gen"], "kill-task-managers");
    }

    #[test]
    fn unwritable_path_is_an_output_error() {
        let config = config();
        let outcome = outcome(&config);
        let path = Path::new("/nonexistent/dir/results.json");
        let err = write_results(path, &config, &outcome).unwrap_err();
        assert!(matches!(err, Error::Output { .. }));
    }

    #[test]
    fn recovery_stamped_before_its_fault_prints_without_panicking() {
        let config = config();
        let mut outcome = outcome(&config);
        let record = &mut outcome.report.recoveries[0];
        record.outcome = RecoveryOutcome::Recovered {
            at: record.window.fault_end - Duration::from_secs(1),
        };
        assert_eq!(record.recovery_time(), Some(Duration::ZERO));
        print_outcome(&config, &outcome);
    }
}
