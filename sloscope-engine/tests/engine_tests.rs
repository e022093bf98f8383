//! End-to-end engine tests: specs parsed from YAML, run through the
//! in-memory recording driver with fake collaborators.

use std::collections::BTreeMap;

use sloscope_engine::tasks::collect_http::{CollectHttpInputs, HttpEndpoint};
use sloscope_engine::tasks::custom_metrics::{ProviderMetric, ProviderSpec};
use sloscope_engine::{
    run_experiment, Config, EngineError, Experiment, HttpLoadDriver, LoadSummary, MetricValue,
    MetricsQuerier, RecordingDriver, RunContext,
};

struct FakeHttpDriver {
    latencies: Vec<f64>,
    errors: f64,
}

impl HttpLoadDriver for FakeHttpDriver {
    fn collect(
        &self,
        _inputs: &CollectHttpInputs,
        _endpoint: &HttpEndpoint,
    ) -> Result<LoadSummary, EngineError> {
        let requests = self.latencies.len() as f64;
        Ok(LoadSummary {
            request_count: requests,
            error_count: self.errors,
            error_rate: if requests > 0.0 {
                self.errors / requests
            } else {
                0.0
            },
            latencies_ms: self.latencies.clone(),
        })
    }
}

struct ScalarQuerier;

impl MetricsQuerier for ScalarQuerier {
    fn query(
        &self,
        _backend: &ProviderSpec,
        _metric: &ProviderMetric,
        _version: usize,
        _values: &BTreeMap<String, String>,
    ) -> Result<MetricValue, EngineError> {
        Ok(MetricValue::Scalar(1.0))
    }
}

fn experiment_from_spec(yaml: &str) -> Experiment {
    Experiment {
        spec: serde_yaml::from_str(yaml).expect("spec should parse"),
        result: None,
    }
}

#[test]
fn test_http_happy_path() {
    let exp = experiment_from_spec(
        r#"
- task: http
  with:
    url: https://example.com/get
    duration: 2s
- task: assess
  with:
    SLOs:
      upper:
        - metric: http/error-rate
          limit: 0
        - metric: http/latency/p95
          limit: 100
"#,
    );
    let driver = RecordingDriver::new(exp);
    let context = RunContext::new(Config::default()).with_http_load_driver(Box::new(
        FakeHttpDriver {
            latencies: vec![10.0, 20.0, 30.0, 40.0],
            errors: 0.0,
        },
    ));

    run_experiment(false, &driver, &context).unwrap();

    let last = driver.last_write().unwrap();
    let result = last.result.as_ref().unwrap();
    assert_eq!(result.num_completed_tasks, 2);
    assert!(!result.failure);
    let satisfied = result
        .insights
        .as_ref()
        .unwrap()
        .slos_satisfied
        .as_ref()
        .unwrap();
    assert_eq!(satisfied.upper, vec![vec![true], vec![true]]);
    assert!(last.slos());
    assert!(last.completed());
    assert!(last.no_failure());
}

#[test]
fn test_conditional_skip_on_unsatisfied_slos() {
    // No load task ran, so assess records zero versions and SLOs() is false;
    // the run task is skipped but still counted.
    let exp = experiment_from_spec(
        r#"
- task: assess
  with:
    SLOs:
      upper:
        - metric: http/error-rate
          limit: 0
- run: "exit 1"
  if: SLOs()
"#,
    );
    let driver = RecordingDriver::new(exp);
    let context = RunContext::default();

    run_experiment(false, &driver, &context).unwrap();

    let last = driver.last_write().unwrap();
    let result = last.result.as_ref().unwrap();
    assert_eq!(result.num_completed_tasks, 2);
    assert!(!result.failure);
}

#[test]
fn test_metric_meta_conflict_fails_second_task() {
    let exp = experiment_from_spec(
        r#"
- task: custom-metrics
  with:
    backends:
      - name: prom
        metrics:
          - name: requests
            description: request count
            type: counter
    versionValues:
      - {}
- task: custom-metrics
  with:
    backends:
      - name: prom
        metrics:
          - name: requests
            description: request count
            type: gauge
    versionValues:
      - {}
"#,
    );
    let driver = RecordingDriver::new(exp);
    let context = RunContext::new(Config::default()).with_metrics_querier(Box::new(ScalarQuerier));

    let err = run_experiment(false, &driver, &context).unwrap_err();
    assert!(matches!(err, EngineError::Invariant(_)));

    let last = driver.last_write().unwrap();
    let result = last.result.as_ref().unwrap();
    assert!(result.failure);
    assert_eq!(result.num_completed_tasks, 1);
}

#[test]
fn test_persists_after_loop_increment_and_each_task() {
    let exp = experiment_from_spec("- run: echo one\n- run: echo two\n");
    let driver = RecordingDriver::new(exp);
    run_experiment(false, &driver, &RunContext::default()).unwrap();

    let writes = driver.writes();
    assert_eq!(writes.len(), 3); // loop increment, then one per task
    assert_eq!(writes[0].result.as_ref().unwrap().num_completed_tasks, 0);
    assert_eq!(writes[0].result.as_ref().unwrap().num_loops, 1);
    assert_eq!(writes[1].result.as_ref().unwrap().num_completed_tasks, 1);
    assert_eq!(writes[2].result.as_ref().unwrap().num_completed_tasks, 2);
}

#[test]
fn test_clean_run_completes_every_task() {
    let exp = experiment_from_spec("- run: echo a\n- run: echo b\n- run: echo c\n");
    let driver = RecordingDriver::new(exp);
    run_experiment(false, &driver, &RunContext::default()).unwrap();

    let last = driver.last_write().unwrap();
    assert_eq!(
        last.result.as_ref().unwrap().num_completed_tasks,
        last.spec.len()
    );
    assert!(last.completed());
}

#[test]
fn test_task_failure_latches_and_aborts() {
    let exp = experiment_from_spec("- run: exit 7\n- run: echo unreachable\n");
    let driver = RecordingDriver::new(exp);
    let err = run_experiment(false, &driver, &RunContext::default()).unwrap_err();
    assert!(matches!(err, EngineError::Task(_)));

    let last = driver.last_write().unwrap();
    let result = last.result.as_ref().unwrap();
    assert!(result.failure);
    assert_eq!(result.num_completed_tasks, 0);
    // loop write plus the failure write
    assert_eq!(driver.writes().len(), 2);
}

#[test]
fn test_reuse_result_observes_previous_failure() {
    let mut exp = experiment_from_spec("- run: exit 7\n");
    let driver = RecordingDriver::new(exp.clone());
    let _ = run_experiment(false, &driver, &RunContext::default());

    // a re-entry with reuse_result sees the latched failure and loop count
    exp = driver.last_write().unwrap();
    let driver = RecordingDriver::new(exp);
    let _ = run_experiment(true, &driver, &RunContext::default());

    let last = driver.last_write().unwrap();
    let result = last.result.as_ref().unwrap();
    assert!(result.failure);
    assert_eq!(result.num_loops, 2);
}

#[test]
fn test_fresh_run_resets_result() {
    let exp = experiment_from_spec("- run: echo ok\n");
    let driver = RecordingDriver::new(exp).with_revision(3);
    run_experiment(false, &driver, &RunContext::default()).unwrap();

    let prior = driver.last_write().unwrap();
    assert_eq!(prior.result.as_ref().unwrap().revision, 3);
    assert_eq!(prior.result.as_ref().unwrap().num_loops, 1);

    // running again without reuse starts a fresh result at the new revision
    let driver = RecordingDriver::new(prior).with_revision(4);
    run_experiment(false, &driver, &RunContext::default()).unwrap();
    let result = driver.last_write().unwrap().result.unwrap();
    assert_eq!(result.revision, 4);
    assert_eq!(result.num_loops, 1);
    assert_eq!(result.num_completed_tasks, 1);
}

#[test]
fn test_predicate_compile_failure_is_fatal() {
    let exp = experiment_from_spec("- run: echo ok\n  if: \"SLOs(\"\n");
    let driver = RecordingDriver::new(exp);
    let err = run_experiment(false, &driver, &RunContext::default()).unwrap_err();
    assert!(matches!(err, EngineError::Predicate(_)));

    // the predicate failed before the task ran, so nothing was counted
    let last = driver.last_write().unwrap();
    assert_eq!(last.result.as_ref().unwrap().num_completed_tasks, 0);
}

#[test]
fn test_looping_accumulates_observations() {
    let exp = experiment_from_spec(
        r#"
- task: http
  with:
    url: https://example.com/get
"#,
    );
    let driver = RecordingDriver::new(exp);
    let context = RunContext::new(Config::default()).with_http_load_driver(Box::new(
        FakeHttpDriver {
            latencies: vec![10.0, 20.0],
            errors: 0.0,
        },
    ));

    run_experiment(false, &driver, &context).unwrap();
    let exp = driver.last_write().unwrap();
    let driver = RecordingDriver::new(exp);
    run_experiment(true, &driver, &context).unwrap();

    let last = driver.last_write().unwrap();
    let result = last.result.as_ref().unwrap();
    assert_eq!(result.num_loops, 2);
    let insights = result.insights.as_ref().unwrap();
    // the latency sample accumulated across both loops
    assert_eq!(
        insights.non_hist_metric_values[0]["http/latency"],
        vec![10.0, 20.0, 10.0, 20.0]
    );
    assert_eq!(
        insights.non_hist_metric_values[0]["http/request-count"],
        vec![2.0, 2.0]
    );
}
