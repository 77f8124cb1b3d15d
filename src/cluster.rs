//! Cluster lifecycle collaborators: start before the run, tear down after.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::client::{ClusterClient, OpFuture};
use crate::error::ClusterError;
use crate::test_spec::{JobSpec, TestSpec};

/// What every component is started with.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterContext {
    /// Opaque to us; passed through to the job managers' HA setup.
    pub ha_storage_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSpec>,
}

pub trait Lifecycle {
    fn name(&self) -> &str;

    fn start<'a>(&'a self, ctx: &'a ClusterContext) -> OpFuture<'a, ()>;

    fn teardown<'a>(&'a self, ctx: &'a ClusterContext) -> OpFuture<'a, ()>;
}

/// A component the control agent starts and stops on our behalf.
pub struct RemoteComponent {
    name: String,
    client: Arc<ClusterClient>,
}

impl RemoteComponent {
    pub fn new(name: impl Into<String>, client: Arc<ClusterClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

impl Lifecycle for RemoteComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn start<'a>(&'a self, ctx: &'a ClusterContext) -> OpFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .control(&format!("/cluster/{}/start", self.name), ctx)
                .await
        })
    }

    fn teardown<'a>(&'a self, ctx: &'a ClusterContext) -> OpFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .control(&format!("/cluster/{}/teardown", self.name), ctx)
                .await
        })
    }
}

/// Starts components in order and tears them down in reverse.
///
/// If a component fails to start, the ones already started are torn down
/// before the error is returned.
pub struct Sequence {
    components: Vec<Box<dyn Lifecycle>>,
}

impl Sequence {
    pub fn new(components: Vec<Box<dyn Lifecycle>>) -> Self {
        Self { components }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    async fn teardown_prefix(
        &self,
        ctx: &ClusterContext,
        started: usize,
    ) -> Result<(), ClusterError> {
        let mut first_error = None;
        for component in self.components[..started].iter().rev() {
            info!(component = component.name(), "tearing down");
            if let Err(e) = component.teardown(ctx).await {
                warn!(component = component.name(), error = %e, "teardown failed");
                first_error.get_or_insert(ClusterError::Component {
                    component: component.name().to_string(),
                    source: Box::new(e),
                });
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Lifecycle for Sequence {
    fn name(&self) -> &str {
        "sequence"
    }

    fn start<'a>(&'a self, ctx: &'a ClusterContext) -> OpFuture<'a, ()> {
        Box::pin(async move {
            for (started, component) in self.components.iter().enumerate() {
                info!(component = component.name(), "starting");
                if let Err(e) = component.start(ctx).await {
                    warn!(component = component.name(), error = %e, "start failed, rolling back");
                    let err = ClusterError::Component {
                        component: component.name().to_string(),
                        source: Box::new(e),
                    };
                    return match self.teardown_prefix(ctx, started).await {
                        Ok(()) => Err(err),
                        Err(rollback) => {
                            warn!(error = %rollback, "rollback after failed start incomplete");
                            Err(ClusterError::RollbackFailed {
                                source: Box::new(err),
                                rollback: Box::new(rollback),
                            })
                        }
                    };
                }
            }
            Ok(())
        })
    }

    fn teardown<'a>(&'a self, ctx: &'a ClusterContext) -> OpFuture<'a, ()> {
        Box::pin(self.teardown_prefix(ctx, self.components.len()))
    }
}

/// One remote component per entry of the test spec's `dbs`, in order.
pub fn from_spec(spec: &TestSpec, client: Arc<ClusterClient>) -> Sequence {
    Sequence::new(
        spec.dbs
            .iter()
            .map(|name| {
                Box::new(RemoteComponent::new(name.clone(), client.clone())) as Box<dyn Lifecycle>
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Journal = Rc<RefCell<Vec<String>>>;

    struct FakeComponent {
        name: &'static str,
        fail_start: bool,
        fail_teardown: bool,
        journal: Journal,
    }

    impl Lifecycle for FakeComponent {
        fn name(&self) -> &str {
            self.name
        }

        fn start<'a>(&'a self, _ctx: &'a ClusterContext) -> OpFuture<'a, ()> {
            Box::pin(async move {
                self.journal.borrow_mut().push(format!("start {}", self.name));
                if self.fail_start {
                    return Err(ClusterError::Status {
                        op: "start".into(),
                        status: 500,
                        body: "disk full".into(),
                    });
                }
                Ok(())
            })
        }

        fn teardown<'a>(&'a self, _ctx: &'a ClusterContext) -> OpFuture<'a, ()> {
            Box::pin(async move {
                self.journal.borrow_mut().push(format!("teardown {}", self.name));
                if self.fail_teardown {
                    return Err(ClusterError::Request {
                        op: "teardown".into(),
                        reason: "connection reset".into(),
                    });
                }
                Ok(())
            })
        }
    }

    fn ctx() -> ClusterContext {
        ClusterContext {
            ha_storage_dir: "hdfs:///flink/ha".into(),
            job: None,
        }
    }

    fn sequence(journal: &Journal, failing: Option<&'static str>) -> Sequence {
        sequence_with_teardown_failure(journal, failing, None)
    }

    fn sequence_with_teardown_failure(
        journal: &Journal,
        failing: Option<&'static str>,
        failing_teardown: Option<&'static str>,
    ) -> Sequence {
        Sequence::new(
            ["zookeeper", "hadoop", "flink-yarn-session"]
                .into_iter()
                .map(|name| {
                    Box::new(FakeComponent {
                        name,
                        fail_start: failing == Some(name),
                        fail_teardown: failing_teardown == Some(name),
                        journal: journal.clone(),
                    }) as Box<dyn Lifecycle>
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn starts_in_order_and_tears_down_in_reverse() {
        let journal = Journal::default();
        let cluster = sequence(&journal, None);
        cluster.start(&ctx()).await.unwrap();
        cluster.teardown(&ctx()).await.unwrap();
        assert_eq!(
            *journal.borrow(),
            vec![
                "start zookeeper",
                "start hadoop",
                "start flink-yarn-session",
                "teardown flink-yarn-session",
                "teardown hadoop",
                "teardown zookeeper",
            ]
        );
    }

    #[tokio::test]
    async fn failed_start_rolls_back_started_components() {
        let journal = Journal::default();
        let cluster = sequence(&journal, Some("hadoop"));
        let err = cluster.start(&ctx()).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Component { ref component, .. } if component == "hadoop"
        ));
        assert_eq!(
            *journal.borrow(),
            vec!["start zookeeper", "start hadoop", "teardown zookeeper"]
        );
    }

    #[tokio::test]
    async fn failed_rollback_is_reported_with_the_start_error() {
        let journal = Journal::default();
        let cluster =
            sequence_with_teardown_failure(&journal, Some("flink-yarn-session"), Some("hadoop"));
        let err = cluster.start(&ctx()).await.unwrap_err();
        match err {
            ClusterError::RollbackFailed { source, rollback } => {
                let failed_start = match *source {
                    ClusterError::Component { component, .. } => component,
                    other => panic!("unexpected start error: {other:?}"),
                };
                assert_eq!(failed_start, "flink-yarn-session");
                assert!(matches!(
                    *rollback,
                    ClusterError::Component { ref component, .. } if component == "hadoop"
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Rollback keeps going past the failed teardown.
        assert_eq!(
            *journal.borrow(),
            vec![
                "start zookeeper",
                "start hadoop",
                "start flink-yarn-session",
                "teardown hadoop",
                "teardown zookeeper",
            ]
        );
    }

    #[test]
    fn builds_one_component_per_db() {
        let spec = TestSpec {
            dbs: vec!["zookeeper".into(), "kafka".into()],
            job: None,
        };
        let client = Arc::new(
            ClusterClient::new("http://localhost:8081", "http://localhost:8090").unwrap(),
        );
        let cluster = from_spec(&spec, client);
        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster.components[1].name(), "kafka");
    }

    #[test]
    fn context_serializes_for_the_agent() {
        let value = serde_json::to_value(ctx()).unwrap();
        assert_eq!(value, serde_json::json!({"ha_storage_dir": "hdfs:///flink/ha"}));
    }
}
