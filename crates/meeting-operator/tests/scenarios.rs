//! End-to-end reconciles against an in-memory cluster and mocked metric backends.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use meeting_operator::{
    controller::{ReconcileAction, reconcile_autoscaler},
    crd::{AutoScaler, AutoScalerSpec, BackendAuth, FINALIZER, MetricSpec, ScaleTargetRef},
    error::ErrorKind,
    finalizer::{self, FinalizerStore},
    target::{self, TargetStore, TargetWorkload},
};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path, query_param},
};

const NAMESPACE: &str = "jitsi";
const TARGET: &str = "jvb";

/// Holds JVB replica counts and records every write the controller issues.
#[derive(Default)]
struct FakeCluster {
    replicas: Mutex<HashMap<String, i32>>,
    replica_writes: Mutex<Vec<i32>>,
    finalizer_writes: Mutex<Vec<BTreeSet<String>>>,
    conflict_on_write: bool,
}

impl FakeCluster {
    fn with_target(replicas: i32) -> Self {
        let cluster = Self::default();
        cluster
            .replicas
            .lock()
            .unwrap()
            .insert(TARGET.to_owned(), replicas);
        cluster
    }

    fn replicas(&self) -> i32 {
        self.replicas.lock().unwrap()[TARGET]
    }

    fn replica_writes(&self) -> Vec<i32> {
        self.replica_writes.lock().unwrap().clone()
    }

    fn finalizer_writes(&self) -> Vec<BTreeSet<String>> {
        self.finalizer_writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl FinalizerStore for FakeCluster {
    async fn set_finalizers(
        &self,
        _autoscaler: &AutoScaler,
        finalizers: &BTreeSet<String>,
    ) -> Result<(), finalizer::Error> {
        self.finalizer_writes
            .lock()
            .unwrap()
            .push(finalizers.clone());
        Ok(())
    }
}

#[async_trait]
impl TargetStore for FakeCluster {
    async fn load_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<TargetWorkload, target::Error> {
        let replicas = self.replicas.lock().unwrap().get(name).copied();
        match replicas {
            Some(replicas) => Ok(TargetWorkload {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
                resource_version: Some("1".to_owned()),
                replicas,
            }),
            None => Err(target::Error::NotFound {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            }),
        }
    }

    async fn write_replicas(
        &self,
        target: &TargetWorkload,
        replicas: i32,
    ) -> Result<(), target::Error> {
        if self.conflict_on_write {
            return Err(target::Error::Conflict {
                name: target.name.clone(),
                namespace: target.namespace.clone(),
            });
        }

        self.replica_writes.lock().unwrap().push(replicas);
        self.replicas
            .lock()
            .unwrap()
            .insert(target.name.clone(), replicas);
        Ok(())
    }
}

struct Scaler {
    backend_type: &'static str,
    host: String,
    bucket: Option<&'static str>,
    metric: &'static str,
    target: i32,
    min: i32,
    max: i32,
    interval: &'static str,
}

impl Scaler {
    fn build(self, finalizers: &[&str]) -> AutoScaler {
        let mut autoscaler = AutoScaler::new(
            "jvb-scaler",
            AutoScalerSpec {
                backend_type: self.backend_type.to_owned(),
                host: self.host,
                auth: Some(BackendAuth {
                    token: Some("secret".to_owned()),
                    ..BackendAuth::default()
                }),
                bucket: self.bucket.map(ToOwned::to_owned),
                org: Some("meeting".to_owned()),
                scale_target_ref: ScaleTargetRef {
                    name: TARGET.to_owned(),
                },
                metric: MetricSpec {
                    name: self.metric.to_owned(),
                    target_average_utilization: self.target,
                },
                min_replicas: self.min,
                max_replicas: self.max,
                interval: self.interval.to_owned(),
            },
        );
        autoscaler.metadata = ObjectMeta {
            name: Some("jvb-scaler".to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            resource_version: Some("3".to_owned()),
            finalizers: Some(finalizers.iter().map(|f| (*f).to_owned()).collect()),
            ..ObjectMeta::default()
        };
        autoscaler
    }
}

async fn prometheus(values: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    let series: Vec<_> = values
        .iter()
        .map(|value| json!({ "metric": { "pod": "jvb-0" }, "values": [[1_700_000_000, value]] }))
        .collect();

    Mock::given(method("GET"))
        .and(path("/api/v1/query_range"))
        .and(query_param("step", "900"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "data": { "resultType": "matrix", "result": series },
        })))
        .mount(&server)
        .await;
    server
}

async fn influxdb(csv: &'static str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/query"))
        .and(query_param("org", "meeting"))
        .respond_with(ResponseTemplate::new(200).set_body_string(csv))
        .mount(&server)
        .await;
    server
}

fn finalizer_set() -> BTreeSet<String> {
    BTreeSet::from([FINALIZER.to_owned()])
}

#[tokio::test]
async fn overloaded_pool_is_capped_at_max_replicas() {
    let backend = prometheus(&["200"]).await;
    let cluster = FakeCluster::with_target(3);
    let autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host: backend.uri(),
        bucket: None,
        metric: "cpu",
        target: 50,
        min: 1,
        max: 10,
        interval: "",
    }
    .build(&[]);

    let action = reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();

    assert_eq!(action, ReconcileAction::Requeue(Duration::from_secs(30)));
    assert_eq!(cluster.replicas(), 10);
    assert_eq!(cluster.finalizer_writes(), vec![finalizer_set()]);
}

#[tokio::test]
async fn idle_pool_is_raised_to_min_replicas() {
    let backend = prometheus(&["4", "6"]).await;
    let cluster = FakeCluster::with_target(8);
    let autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host: backend.uri(),
        bucket: None,
        metric: "conferences",
        target: 10,
        min: 2,
        max: 20,
        interval: "1m",
    }
    .build(&[FINALIZER]);

    let action = reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();

    assert_eq!(action, ReconcileAction::Requeue(Duration::from_secs(60)));
    assert_eq!(cluster.replicas(), 2);
    assert!(cluster.finalizer_writes().is_empty());
}

#[tokio::test]
async fn load_at_target_keeps_the_pool() {
    let backend = influxdb(
        "#datatype,string,long,dateTime:RFC3339,string,double\r\n\
         ,result,table,_time,_field,_value\r\n\
         ,_result,0,2026-10-17T10:00:00Z,participants,3\r\n\
         ,_result,0,2026-10-17T10:05:00Z,participants,5\r\n",
    )
    .await;
    let cluster = FakeCluster::with_target(6);
    let autoscaler = Scaler {
        backend_type: "bucketTSDB",
        host: backend.uri(),
        bucket: Some("jitsi"),
        metric: "participants",
        target: 4,
        min: 0,
        max: 100,
        interval: "15s",
    }
    .build(&[FINALIZER]);

    let action = reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();

    assert_eq!(action, ReconcileAction::Requeue(Duration::from_secs(15)));
    assert_eq!(cluster.replica_writes(), vec![6]);
}

#[tokio::test]
async fn unreachable_backend_scales_on_degraded_sample() {
    let host = {
        let server = MockServer::start().await;
        server.uri()
    };
    let cluster = FakeCluster::with_target(5);
    let autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host,
        bucket: None,
        metric: "cpu",
        target: 10,
        min: 1,
        max: 10,
        interval: "20s",
    }
    .build(&[FINALIZER]);

    let action = reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();

    assert_eq!(action, ReconcileAction::Requeue(Duration::from_secs(20)));
    assert_eq!(cluster.replicas(), 1);
}

#[tokio::test]
async fn zero_interval_requeues_after_the_default() {
    let backend = prometheus(&["50"]).await;
    let cluster = FakeCluster::with_target(2);
    let autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host: backend.uri(),
        bucket: None,
        metric: "cpu",
        target: 50,
        min: 1,
        max: 10,
        interval: "0s",
    }
    .build(&[FINALIZER]);

    let action = reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();

    assert_eq!(action, ReconcileAction::Requeue(Duration::from_secs(30)));
    assert_eq!(cluster.replica_writes(), vec![2]);
}

#[tokio::test]
async fn deleted_autoscaler_releases_its_finalizer() {
    let cluster = FakeCluster::with_target(7);
    let mut autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host: "http://prometheus.invalid:9090".to_owned(),
        bucket: None,
        metric: "cpu",
        target: 50,
        min: 1,
        max: 10,
        interval: "",
    }
    .build(&["other", FINALIZER]);
    autoscaler.metadata.deletion_timestamp = Some(Time(k8s_openapi::jiff::Timestamp::now()));

    let action = reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();

    assert_eq!(action, ReconcileAction::Done);
    assert_eq!(cluster.replicas(), 7);
    assert!(cluster.replica_writes().is_empty());
    assert_eq!(
        cluster.finalizer_writes(),
        vec![BTreeSet::from(["other".to_owned()])]
    );
}

#[tokio::test]
async fn unknown_backend_waits_for_a_fixed_spec() {
    let cluster = FakeCluster::with_target(4);
    let autoscaler = Scaler {
        backend_type: "nonsense",
        host: "http://metrics:9090".to_owned(),
        bucket: None,
        metric: "cpu",
        target: 50,
        min: 1,
        max: 10,
        interval: "",
    }
    .build(&[]);

    let action = reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();

    assert_eq!(action, ReconcileAction::Done);
    assert_eq!(cluster.replicas(), 4);
    assert!(cluster.replica_writes().is_empty());
    assert_eq!(cluster.finalizer_writes(), vec![finalizer_set()]);
}

#[tokio::test]
async fn unknown_metric_scales_like_an_idle_pool() {
    let backend = prometheus(&["500"]).await;
    let cluster = FakeCluster::with_target(6);
    let autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host: backend.uri(),
        bucket: None,
        metric: "bandwidth",
        target: 10,
        min: 3,
        max: 10,
        interval: "",
    }
    .build(&[FINALIZER]);

    reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();

    assert_eq!(cluster.replicas(), 3);
}

#[tokio::test]
async fn repeated_reconciles_write_the_same_replicas() {
    let backend = prometheus(&["120", "80"]).await;
    let cluster = FakeCluster::with_target(2);
    let autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host: backend.uri(),
        bucket: None,
        metric: "participants",
        target: 100,
        min: 1,
        max: 10,
        interval: "",
    }
    .build(&[FINALIZER]);

    for _ in 0..2 {
        reconcile_autoscaler(&autoscaler, &cluster).await.unwrap();
    }

    assert_eq!(cluster.replica_writes(), vec![2, 2]);
}

#[tokio::test]
async fn missing_scale_target_is_surfaced() {
    let backend = prometheus(&["10"]).await;
    let cluster = FakeCluster::default();
    let autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host: backend.uri(),
        bucket: None,
        metric: "cpu",
        target: 10,
        min: 1,
        max: 10,
        interval: "",
    }
    .build(&[FINALIZER]);

    let error = reconcile_autoscaler(&autoscaler, &cluster)
        .await
        .expect_err("scale target is missing");

    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn lost_write_race_is_surfaced_as_conflict() {
    let backend = prometheus(&["10"]).await;
    let cluster = FakeCluster {
        conflict_on_write: true,
        ..FakeCluster::with_target(4)
    };
    let autoscaler = Scaler {
        backend_type: "rangeTSDB",
        host: backend.uri(),
        bucket: None,
        metric: "cpu",
        target: 10,
        min: 1,
        max: 10,
        interval: "",
    }
    .build(&[FINALIZER]);

    let error = reconcile_autoscaler(&autoscaler, &cluster)
        .await
        .expect_err("write conflicts");

    assert_eq!(error.kind(), ErrorKind::Conflict);
    assert_eq!(cluster.replicas(), 4);
}
