//! Command-line options and the validated run configuration built from them.
//!
//! Everything here is checked before the cluster is touched: generator names
//! are looked up, ranges are enforced, and the test spec is loaded.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;

use crate::checker::RecoveryParams;
use crate::error::ConfigError;
use crate::generator::{ClientGen, DEFAULT_CLIENT_GEN};
use crate::nemesis::{FaultParams, FaultRegistry, DEFAULT_NEMESIS_GEN};
use crate::test_spec::TestSpec;

/// Shortest grace period that gives a restarted job a fair chance.
pub const MIN_GRACE_PERIOD_SECS: u64 = 60;

/// Longest accepted value for any duration option (one week).
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Parser)]
#[command(
    name = "chaos-tester",
    about = "Kills parts of a job cluster and checks the job comes back"
)]
pub struct Args {
    /// Test specification (JSON) selecting the cluster components
    #[arg(long)]
    pub test_spec: PathBuf,

    /// HA storage directory handed to the cluster components
    #[arg(long)]
    pub ha_storage_dir: String,

    /// Fault strategy to run
    #[arg(long, default_value = DEFAULT_NEMESIS_GEN)]
    pub nemesis_gen: String,

    /// Client operation sequence to run
    #[arg(long, default_value = DEFAULT_CLIENT_GEN)]
    pub client_gen: String,

    /// Consecutive healthy polls that count as recovered
    #[arg(long, default_value_t = 5)]
    pub job_running_healthy_threshold: u32,

    /// Seconds the job may take to recover after a fault
    #[arg(long, default_value_t = 180)]
    pub job_recovery_grace_period: u64,

    /// Seconds of fault injection before the nemesis is stopped
    #[arg(long, default_value_t = 120)]
    pub time_limit: u64,

    /// Seconds between job status polls
    #[arg(long, default_value_t = 5)]
    pub poll_interval: u64,

    /// Seconds of polling before cancel-job cancels the job
    #[arg(long, default_value_t = 15)]
    pub cancel_after: u64,

    /// Job REST API base URL
    #[arg(long, default_value = "http://localhost:8081")]
    pub url: String,

    /// Cluster control agent base URL (provisioning and faults)
    #[arg(long, default_value = "http://localhost:8090")]
    pub control_url: String,

    /// Write config, verdict, report and history to this JSON file
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub test_spec_path: PathBuf,
    pub test_spec: TestSpec,
    pub ha_storage_dir: String,
    pub nemesis_gen: String,
    pub client_gen: ClientGen,
    pub recovery: RecoveryParams,
    pub poll_interval: Duration,
    pub cancel_after: Duration,
    pub time_limit: Duration,
    pub url: String,
    pub control_url: String,
    #[serde(skip)]
    pub out: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_args(args: &Args, faults: &FaultRegistry) -> Result<Self, ConfigError> {
        if args.job_running_healthy_threshold == 0 {
            return Err(ConfigError::ThresholdOutOfRange(args.job_running_healthy_threshold));
        }
        if args.job_recovery_grace_period < MIN_GRACE_PERIOD_SECS {
            return Err(ConfigError::GracePeriodTooShort {
                got: args.job_recovery_grace_period,
                min: MIN_GRACE_PERIOD_SECS,
            });
        }
        let positive = [
            ("poll-interval", args.poll_interval),
            ("time-limit", args.time_limit),
        ];
        for (name, got) in positive {
            if got == 0 {
                return Err(ConfigError::NonPositive { name, got });
            }
        }
        let bounded = [
            ("job-recovery-grace-period", args.job_recovery_grace_period),
            ("time-limit", args.time_limit),
            ("poll-interval", args.poll_interval),
            ("cancel-after", args.cancel_after),
        ];
        for (name, got) in bounded {
            if got > MAX_DURATION_SECS {
                return Err(ConfigError::TooLarge {
                    name,
                    got,
                    max: MAX_DURATION_SECS,
                });
            }
        }

        faults.resolve(&args.nemesis_gen)?;
        let client_gen = ClientGen::resolve(&args.client_gen)?;
        let test_spec = TestSpec::load(&args.test_spec)?;

        Ok(Self {
            test_spec_path: args.test_spec.clone(),
            test_spec,
            ha_storage_dir: args.ha_storage_dir.clone(),
            nemesis_gen: args.nemesis_gen.clone(),
            client_gen,
            recovery: RecoveryParams {
                healthy_threshold: args.job_running_healthy_threshold,
                grace_period: Duration::from_secs(args.job_recovery_grace_period),
            },
            poll_interval: Duration::from_secs(args.poll_interval),
            cancel_after: Duration::from_secs(args.cancel_after),
            time_limit: Duration::from_secs(args.time_limit),
            url: args.url.clone(),
            control_url: args.control_url.clone(),
            out: args.out.clone(),
        })
    }

    pub fn fault_params(&self) -> FaultParams {
        FaultParams {
            healthy_threshold: self.recovery.healthy_threshold,
            grace_period: self.recovery.grace_period,
            poll_interval: self.poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn spec_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"dbs": ["zookeeper", "flink-standalone-session"]}}"#).unwrap();
        file
    }

    fn args(spec: &std::path::Path, extra: &[&str]) -> Args {
        let mut argv = vec![
            "chaos-tester",
            "--test-spec",
            spec.to_str().unwrap(),
            "--ha-storage-dir",
            "hdfs:///ha",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let spec = spec_file();
        let config =
            RunConfig::from_args(&args(spec.path(), &[]), &FaultRegistry::builtin()).unwrap();
        assert_eq!(config.nemesis_gen, "kill-task-managers");
        assert_eq!(config.client_gen, ClientGen::PollJobRunning);
        assert_eq!(config.recovery.healthy_threshold, 5);
        assert_eq!(config.recovery.grace_period, Duration::from_secs(180));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.cancel_after, Duration::from_secs(15));
        assert_eq!(config.test_spec.dbs.len(), 2);
    }

    #[test]
    fn grace_period_below_minimum_is_rejected() {
        let spec = spec_file();
        let a = args(spec.path(), &["--job-recovery-grace-period", "30"]);
        assert_eq!(
            RunConfig::from_args(&a, &FaultRegistry::builtin()).unwrap_err(),
            ConfigError::GracePeriodTooShort { got: 30, min: 60 }
        );

        let a = args(spec.path(), &["--job-recovery-grace-period", "60"]);
        assert!(RunConfig::from_args(&a, &FaultRegistry::builtin()).is_ok());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let spec = spec_file();
        let max = u64::MAX.to_string();
        for flag in ["--job-recovery-grace-period", "--time-limit", "--poll-interval"] {
            let a = args(spec.path(), &[flag, max.as_str()]);
            assert!(
                matches!(
                    RunConfig::from_args(&a, &FaultRegistry::builtin()),
                    Err(ConfigError::TooLarge { got: u64::MAX, .. })
                ),
                "{flag} accepted u64::MAX"
            );
        }

        let week = MAX_DURATION_SECS.to_string();
        let a = args(
            spec.path(),
            &[
                "--job-recovery-grace-period",
                week.as_str(),
                "--time-limit",
                week.as_str(),
                "--poll-interval",
                week.as_str(),
                "--job-running-healthy-threshold",
                "4294967295",
            ],
        );
        let config = RunConfig::from_args(&a, &FaultRegistry::builtin()).unwrap();
        let plan = crate::orchestrator::RunPlan::from_config(&config, &FaultRegistry::builtin())
            .unwrap();
        assert!(plan.run_timeout > config.time_limit);
        assert!(config.fault_params().observation_pause() > Duration::ZERO);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let spec = spec_file();
        let a = args(spec.path(), &["--job-running-healthy-threshold", "0"]);
        assert_eq!(
            RunConfig::from_args(&a, &FaultRegistry::builtin()).unwrap_err(),
            ConfigError::ThresholdOutOfRange(0)
        );
    }

    #[test]
    fn negative_threshold_does_not_parse() {
        let parsed = Args::try_parse_from([
            "chaos-tester",
            "--test-spec",
            "spec.json",
            "--ha-storage-dir",
            "/ha",
            "--job-running-healthy-threshold",
            "-1",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn generator_names_are_checked_before_the_spec_is_read() {
        let a = args(
            std::path::Path::new("/does/not/exist.json"),
            &["--nemesis-gen", "unplug-everything"],
        );
        assert!(matches!(
            RunConfig::from_args(&a, &FaultRegistry::builtin()),
            Err(ConfigError::UnknownFaultGenerator { .. })
        ));

        let a = args(
            std::path::Path::new("/does/not/exist.json"),
            &["--client-gen", "nope"],
        );
        assert!(matches!(
            RunConfig::from_args(&a, &FaultRegistry::builtin()),
            Err(ConfigError::UnknownClientGenerator { .. })
        ));
    }

    #[test]
    fn fault_params_mirror_recovery_settings() {
        let spec = spec_file();
        let a = args(
            spec.path(),
            &["--job-running-healthy-threshold", "3", "--poll-interval", "2"],
        );
        let params = RunConfig::from_args(&a, &FaultRegistry::builtin())
            .unwrap()
            .fault_params();
        assert_eq!(params.observation_pause(), Duration::from_secs(6));
    }
}
