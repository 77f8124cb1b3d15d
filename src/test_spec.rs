//! Declarative selection of the cluster components a run provisions.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Components the control agent knows how to bring up, in no particular order.
pub const KNOWN_COMPONENTS: &[&str] = &[
    "zookeeper",
    "hadoop",
    "mesos",
    "kafka",
    "flink-yarn-job",
    "flink-yarn-session",
    "flink-mesos-session",
    "flink-standalone-session",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    /// Components to start, in start order.
    pub dbs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSpec>,
}

/// The job submitted once the cluster is up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub jar: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_class: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
}

impl TestSpec {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::TestSpecUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(path, &contents)
    }

    /// Parse and validate. `path` is only used in error messages.
    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let spec: TestSpec =
            serde_json::from_str(contents).map_err(|e| ConfigError::MalformedTestSpec {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        spec.validate(path)?;
        Ok(spec)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        if self.dbs.is_empty() {
            return Err(ConfigError::MalformedTestSpec {
                path: path.to_path_buf(),
                reason: "dbs must name at least one component".into(),
            });
        }
        if let Some(unknown) = self.dbs.iter().find(|db| !KNOWN_COMPONENTS.contains(&db.as_str())) {
            return Err(ConfigError::UnknownComponent {
                name: unknown.clone(),
                valid: KNOWN_COMPONENTS.iter().map(|name| name.to_string()).collect(),
            });
        }
        if let Some(job) = &self.job {
            if job.jar.trim().is_empty() {
                return Err(ConfigError::MalformedTestSpec {
                    path: path.to_path_buf(),
                    reason: "job.jar must not be empty".into(),
                });
            }
            if job.parallelism == Some(0) {
                return Err(ConfigError::MalformedTestSpec {
                    path: path.to_path_buf(),
                    reason: "job.parallelism must be positive".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(contents: &str) -> Result<TestSpec, ConfigError> {
        TestSpec::parse(Path::new("spec.json"), contents)
    }

    #[test]
    fn loads_spec_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "dbs": ["zookeeper", "hadoop", "flink-yarn-session"],
                "job": {{"jar": "/opt/jobs/datastream.jar", "args": ["--checkpointing", "true"], "parallelism": 4}}
            }}"#
        )
        .unwrap();

        let spec = TestSpec::load(file.path()).unwrap();
        assert_eq!(spec.dbs, vec!["zookeeper", "hadoop", "flink-yarn-session"]);
        let job = spec.job.unwrap();
        assert_eq!(job.parallelism, Some(4));
        assert_eq!(job.main_class, None);
        assert_eq!(job.args.len(), 2);
    }

    #[test]
    fn unknown_component_lists_valid_names() {
        let err = parse(r#"{"dbs": ["zookeeper", "cassandra"]}"#).unwrap_err();
        match err {
            ConfigError::UnknownComponent { name, valid } => {
                assert_eq!(name, "cassandra");
                assert_eq!(valid.len(), KNOWN_COMPONENTS.len());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_specs_are_rejected() {
        for contents in [
            "not json",
            r#"{"dbs": []}"#,
            r#"{"dbs": ["hadoop"], "nemesis": "kill"}"#,
            r#"{"dbs": ["hadoop"], "job": {"jar": " "}}"#,
            r#"{"dbs": ["hadoop"], "job": {"jar": "a.jar", "parallelism": 0}}"#,
        ] {
            assert!(
                matches!(parse(contents), Err(ConfigError::MalformedTestSpec { .. })),
                "{contents}"
            );
        }
    }

    #[test]
    fn missing_file_is_unreadable() {
        let err = TestSpec::load(Path::new("/nonexistent/spec.json")).unwrap_err();
        assert!(matches!(err, ConfigError::TestSpecUnreadable { .. }));
    }
}
