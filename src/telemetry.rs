//! Periodic and on-demand retrieval of VM state for the fleet list and for
//! single-instance detail views.

use crate::api::{ApiError, VmApi};
use crate::config::TelemetryConfig;
use crate::metrics::Metrics;
use crate::schedule::{ScheduledTask, Tick, TriggerHandle};
use crate::state::{FleetStats, VmRecord};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Source: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;

    /// Label for logs and metrics.
    fn view(&self) -> &'static str;

    async fn fetch(&self) -> Result<Self::Data, ApiError>;

    /// Error shown while nothing has ever loaded. `None` keeps the view silent.
    fn unreachable_message(&self) -> Option<&'static str> {
        None
    }

    fn on_loaded(&self, _data: &Self::Data, _metrics: &Metrics) {}
}

pub struct FleetSource {
    api: Arc<dyn VmApi>,
}

impl FleetSource {
    pub fn new(api: Arc<dyn VmApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Source for FleetSource {
    type Data = Vec<VmRecord>;

    fn view(&self) -> &'static str {
        "fleet"
    }

    async fn fetch(&self) -> Result<Self::Data, ApiError> {
        self.api.list_vms().await
    }

    fn on_loaded(&self, data: &Self::Data, metrics: &Metrics) {
        metrics.update_fleet(&FleetStats::from_records(data));
    }
}

pub struct InstanceSource {
    api: Arc<dyn VmApi>,
    vm_id: String,
    limit: usize,
}

impl InstanceSource {
    pub fn new(api: Arc<dyn VmApi>, vm_id: impl Into<String>, limit: usize) -> Self {
        Self {
            api,
            vm_id: vm_id.into(),
            limit,
        }
    }
}

#[async_trait]
impl Source for InstanceSource {
    type Data = VmRecord;

    fn view(&self) -> &'static str {
        "detail"
    }

    async fn fetch(&self) -> Result<Self::Data, ApiError> {
        let record = self.api.get_vm(&self.vm_id, self.limit).await?;
        Ok(record.into_chronological(self.limit))
    }

    fn unreachable_message(&self) -> Option<&'static str> {
        Some("Instance metadata unreachable.")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewSnapshot<T> {
    pub data: Option<T>,
    /// No fetch has finished yet.
    pub initialising: bool,
    pub refreshing: bool,
    pub error: Option<String>,
}

struct ViewState<T> {
    data: Option<T>,
    attempted: bool,
    error: Option<&'static str>,
    manual_inflight: usize,
}

/// Holds the latest successfully fetched data. Whatever response completes
/// last is what the view shows; dispatch order does not matter.
pub struct TelemetryView<S: Source> {
    source: S,
    metrics: Arc<Metrics>,
    min_visible: Duration,
    state: Mutex<ViewState<S::Data>>,
}

impl<S: Source> TelemetryView<S> {
    pub fn new(source: S, metrics: Arc<Metrics>, min_visible: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            metrics,
            min_visible,
            state: Mutex::new(ViewState {
                data: None,
                attempted: false,
                error: None,
                manual_inflight: 0,
            }),
        })
    }

    /// A manual refresh keeps `refreshing` asserted until the fetch is done
    /// and at least `min_visible` has passed since the trigger. Manual
    /// requests arriving while the indicator is shown are dropped.
    pub async fn refresh(&self, manual: bool) {
        let started = Instant::now();
        if manual {
            let mut state = self.state.lock().await;
            if state.manual_inflight > 0 {
                debug!(view = self.source.view(), "ручное обновление уже идёт");
                return;
            }
            state.manual_inflight += 1;
        }

        let result = self.source.fetch().await;
        let view = self.source.view();
        {
            let mut state = self.state.lock().await;
            state.attempted = true;
            match result {
                Ok(data) => {
                    self.source.on_loaded(&data, &self.metrics);
                    state.data = Some(data);
                    state.error = None;
                    self.metrics.inc_refresh(view, "ok");
                    debug!(view, manual, "данные обновлены");
                }
                Err(err) => {
                    self.metrics.inc_refresh(view, "error");
                    if state.data.is_none() {
                        state.error = self.source.unreachable_message();
                    }
                    warn!(view, error = %err, "не удалось обновить данные, показываем предыдущие");
                }
            }
        }

        if manual {
            tokio::time::sleep_until(started + self.min_visible).await;
            let mut state = self.state.lock().await;
            state.manual_inflight = state.manual_inflight.saturating_sub(1);
        }
    }

    pub async fn snapshot(&self) -> ViewSnapshot<S::Data> {
        let state = self.state.lock().await;
        ViewSnapshot {
            data: state.data.clone(),
            initialising: !state.attempted,
            refreshing: state.manual_inflight > 0,
            error: state.error.map(str::to_string),
        }
    }
}

/// A mounted view: its data plus the timer that keeps it fresh.
pub struct TelemetryLoop<S: Source> {
    view: Arc<TelemetryView<S>>,
    task: ScheduledTask,
}

impl<S: Source> TelemetryLoop<S> {
    pub fn start(view: Arc<TelemetryView<S>>, period: Duration) -> Self {
        let task = {
            let view = view.clone();
            ScheduledTask::start(view.source.view(), period, move |tick| {
                let view = view.clone();
                async move { view.refresh(tick == Tick::Manual).await }
            })
        };
        Self { view, task }
    }

    pub fn view(&self) -> &Arc<TelemetryView<S>> {
        &self.view
    }

    pub fn trigger(&self) -> TriggerHandle {
        self.task.trigger()
    }

    pub fn refresh_now(&self) -> bool {
        self.task.trigger().fire(Tick::Manual)
    }

    pub async fn stop(self) {
        debug!(view = self.task.name(), "вид отключён");
        self.task.stop().await;
    }
}

/// Detail views currently mounted, keyed by VM id.
pub struct DetailRegistry {
    api: Arc<dyn VmApi>,
    metrics: Arc<Metrics>,
    limit: usize,
    period: Duration,
    min_visible: Duration,
    mounted: RwLock<HashMap<String, TelemetryLoop<InstanceSource>>>,
}

impl DetailRegistry {
    pub fn new(
        api: Arc<dyn VmApi>,
        metrics: Arc<Metrics>,
        cfg: &TelemetryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            metrics,
            limit: cfg.detail_metrics_limit,
            period: cfg.refresh_interval(),
            min_visible: cfg.manual_refresh_min_visible(),
            mounted: RwLock::new(HashMap::new()),
        })
    }

    /// Returns `false` if the view was already mounted.
    pub async fn mount(&self, vm_id: &str) -> bool {
        let mut mounted = self.mounted.write().await;
        if mounted.contains_key(vm_id) {
            return false;
        }
        let view = TelemetryView::new(
            InstanceSource::new(self.api.clone(), vm_id, self.limit),
            self.metrics.clone(),
            self.min_visible,
        );
        mounted.insert(vm_id.to_string(), TelemetryLoop::start(view, self.period));
        info!(vm_id, "вид инстанса подключён");
        true
    }

    pub async fn unmount(&self, vm_id: &str) -> bool {
        let removed = self.mounted.write().await.remove(vm_id);
        match removed {
            Some(mounted) => {
                mounted.stop().await;
                info!(vm_id, "вид инстанса отключён");
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self, vm_id: &str) -> Option<ViewSnapshot<VmRecord>> {
        let view = self.mounted.read().await.get(vm_id)?.view().clone();
        Some(view.snapshot().await)
    }

    pub async fn refresh_now(&self, vm_id: &str) -> bool {
        self.mounted
            .read()
            .await
            .get(vm_id)
            .is_some_and(|mounted| mounted.refresh_now())
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.mounted.write().await.drain().collect();
        for (_, mounted) in drained {
            mounted.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{transport_error, PollStatus, SetupData};
    use crate::state::MetricSample;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct Reply {
        gate: Option<oneshot::Receiver<()>>,
        outcome: Result<Vec<VmRecord>, ()>,
    }

    #[derive(Default)]
    struct ScriptedApi {
        replies: std::sync::Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn push(&self, outcome: Result<Vec<VmRecord>, ()>) {
            self.replies.lock().unwrap().push_back(Reply { gate: None, outcome });
        }

        fn push_gated(&self, outcome: Result<Vec<VmRecord>, ()>) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.replies.lock().unwrap().push_back(Reply {
                gate: Some(rx),
                outcome,
            });
            tx
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn next(&self) -> Result<Vec<VmRecord>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop_front();
            let Some(reply) = reply else {
                return Ok(Vec::new());
            };
            if let Some(gate) = reply.gate {
                let _ = gate.await;
            }
            reply.outcome.map_err(|()| transport_error())
        }
    }

    #[async_trait]
    impl VmApi for ScriptedApi {
        async fn list_vms(&self) -> Result<Vec<VmRecord>, ApiError> {
            self.next().await
        }

        async fn get_vm(&self, vm_id: &str, _limit: usize) -> Result<VmRecord, ApiError> {
            let mut vms = self.next().await?;
            if vms.is_empty() {
                return Err(ApiError::Status {
                    status: 404,
                    message: None,
                });
            }
            let mut vm = vms.remove(0);
            vm.vm_id = vm_id.to_string();
            Ok(vm)
        }

        async fn create_vm(&self, _vm_name: &str) -> Result<SetupData, ApiError> {
            Err(transport_error())
        }

        async fn poll_token(&self, _polling_link: &str) -> Result<PollStatus, ApiError> {
            Ok(PollStatus::Pending)
        }
    }

    fn vm(name: &str) -> VmRecord {
        VmRecord {
            vm_id: name.to_string(),
            vm_name: name.to_string(),
            ..VmRecord::default()
        }
    }

    fn names(snapshot: &ViewSnapshot<Vec<VmRecord>>) -> Vec<String> {
        snapshot
            .data
            .as_ref()
            .map(|vms| vms.iter().map(|v| v.vm_name.clone()).collect())
            .unwrap_or_default()
    }

    fn fleet_view(api: Arc<ScriptedApi>) -> Arc<TelemetryView<FleetSource>> {
        TelemetryView::new(
            FleetSource::new(api),
            Metrics::new().expect("метрики"),
            Duration::from_millis(2000),
        )
    }

    #[tokio::test]
    async fn fleet_failure_keeps_previous_data_silently() {
        let api = Arc::new(ScriptedApi::default());
        api.push(Ok(vec![vm("alpha"), vm("beta")]));
        api.push(Err(()));
        let view = fleet_view(api.clone());

        assert!(view.snapshot().await.initialising);
        view.refresh(false).await;
        view.refresh(false).await;

        let snapshot = view.snapshot().await;
        assert_eq!(names(&snapshot), vec!["alpha", "beta"]);
        assert_eq!(snapshot.error, None);
        assert!(!snapshot.initialising);
    }

    #[tokio::test]
    async fn success_replaces_records_in_full() {
        let api = Arc::new(ScriptedApi::default());
        api.push(Ok(vec![vm("alpha"), vm("beta")]));
        api.push(Ok(vec![vm("gamma")]));
        let view = fleet_view(api);

        view.refresh(false).await;
        view.refresh(false).await;
        assert_eq!(names(&view.snapshot().await), vec!["gamma"]);
    }

    #[tokio::test]
    async fn detail_reports_unreachable_only_before_first_load() {
        let api = Arc::new(ScriptedApi::default());
        api.push(Err(()));
        let mut record = vm("alpha");
        record.metrics = vec![
            MetricSample {
                timestamp: "t2".to_string(),
                ..MetricSample::default()
            },
            MetricSample {
                timestamp: "t1".to_string(),
                ..MetricSample::default()
            },
        ];
        api.push(Ok(vec![record]));
        api.push(Err(()));

        let view = TelemetryView::new(
            InstanceSource::new(api.clone(), "vm-42", 50),
            Metrics::new().expect("метрики"),
            Duration::from_millis(2000),
        );

        view.refresh(false).await;
        let snapshot = view.snapshot().await;
        assert!(snapshot.data.is_none());
        assert_eq!(snapshot.error.as_deref(), Some("Instance metadata unreachable."));

        view.refresh(false).await;
        let snapshot = view.snapshot().await;
        assert_eq!(snapshot.error, None);
        let data = snapshot.data.expect("данные");
        assert_eq!(data.vm_id, "vm-42");
        let order: Vec<&str> = data.metrics.iter().map(|m| m.timestamp.as_str()).collect();
        assert_eq!(order, vec!["t1", "t2"]);

        view.refresh(false).await;
        let snapshot = view.snapshot().await;
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.data.expect("устаревшие данные").vm_name, "alpha");
    }

    #[tokio::test(start_paused = true)]
    async fn manual_indicator_stays_for_minimum_duration() {
        let api = Arc::new(ScriptedApi::default());
        api.push(Ok(vec![vm("alpha")]));
        let view = fleet_view(api);

        let task = {
            let view = view.clone();
            tokio::spawn(async move { view.refresh(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = view.snapshot().await;
        assert!(snapshot.refreshing);
        assert_eq!(names(&snapshot), vec!["alpha"]);

        tokio::time::sleep(Duration::from_millis(1980)).await;
        assert!(view.snapshot().await.refreshing);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!view.snapshot().await.refreshing);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_indicator_waits_for_slow_fetch() {
        let api = Arc::new(ScriptedApi::default());
        let gate = api.push_gated(Ok(vec![vm("alpha")]));
        let view = fleet_view(api);

        let task = {
            let view = view.clone();
            tokio::spawn(async move { view.refresh(true).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(view.snapshot().await.refreshing);

        gate.send(()).unwrap();
        task.await.unwrap();
        assert!(!view.snapshot().await.refreshing);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_is_ignored_while_indicator_is_shown() {
        let api = Arc::new(ScriptedApi::default());
        let view = fleet_view(api.clone());

        let first = {
            let view = view.clone();
            tokio::spawn(async move { view.refresh(true).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(api.calls(), 1);

        view.refresh(true).await;
        assert_eq!(api.calls(), 1);
        assert!(view.snapshot().await.refreshing);

        view.refresh(false).await;
        assert_eq!(api.calls(), 2);

        tokio::time::sleep(Duration::from_millis(1510)).await;
        first.await.unwrap();
        assert!(!view.snapshot().await.refreshing);

        view.refresh(true).await;
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn last_completed_response_wins() {
        let api = Arc::new(ScriptedApi::default());
        let first_gate = api.push_gated(Ok(vec![vm("dispatched-first")]));
        let second_gate = api.push_gated(Ok(vec![vm("dispatched-second")]));
        let view = fleet_view(api.clone());

        let first = {
            let view = view.clone();
            tokio::spawn(async move { view.refresh(false).await })
        };
        while api.calls() < 1 {
            tokio::task::yield_now().await;
        }
        let second = {
            let view = view.clone();
            tokio::spawn(async move { view.refresh(false).await })
        };
        while api.calls() < 2 {
            tokio::task::yield_now().await;
        }

        second_gate.send(()).unwrap();
        second.await.unwrap();
        assert_eq!(names(&view.snapshot().await), vec!["dispatched-second"]);

        first_gate.send(()).unwrap();
        first.await.unwrap();
        assert_eq!(names(&view.snapshot().await), vec!["dispatched-first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_refreshes_every_period_until_stopped() {
        let api = Arc::new(ScriptedApi::default());
        let view = fleet_view(api.clone());
        let mounted = TelemetryLoop::start(view, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.calls(), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.calls(), 3);

        assert!(mounted.refresh_now());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.calls(), 4);
        assert!(mounted.view().snapshot().await.refreshing);

        let trigger = mounted.trigger();
        mounted.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.calls(), 4);
        assert!(!trigger.fire(Tick::Notified));
    }

    #[tokio::test(start_paused = true)]
    async fn registry_mounts_once_and_stops_on_unmount() {
        let api = Arc::new(ScriptedApi::default());
        api.push(Ok(vec![vm("alpha")]));
        let registry = DetailRegistry::new(
            api.clone(),
            Metrics::new().expect("метрики"),
            &TelemetryConfig::default(),
        );

        assert!(registry.snapshot("vm-1").await.is_none());
        assert!(registry.mount("vm-1").await);
        assert!(!registry.mount("vm-1").await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.calls(), 1);

        let snapshot = registry.snapshot("vm-1").await.expect("вид подключён");
        assert_eq!(snapshot.data.expect("данные").vm_id, "vm-1");

        assert!(registry.unmount("vm-1").await);
        assert!(!registry.unmount("vm-1").await);
        assert!(!registry.refresh_now("vm-1").await);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.calls(), 1);
    }
}
