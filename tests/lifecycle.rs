//! Lifecycle tests -- drive the command facade against an in-process appliance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Notify, Semaphore};

use trafficctl::config::DriverConfig;
use trafficctl::context::{
    CommandContext, Connectivity, CredentialDecryptor, PlaintextCredentials, ReservationDetails,
    ResourceConfig, ResourceDetails, ATTR_PASSWORD, ATTR_SESSIONS_LIMIT, ATTR_USER, SHELL_NAME,
};
use trafficctl::driver::{OperationErrorKind, TrafficControllerDriver};
use trafficctl::error::{DriverError, DriverResult, FetchErrorKind};
use trafficctl::platform::{ApiToken, ManagementApi, Platform, ReservationResources, ReservedPort};
use trafficctl::reservation::LifecycleState;
use trafficctl::session::{ApplianceSession, SessionConnector};
use trafficctl::transfer::{Scheme, TransferFetcher, TransferHandler, TransferRequest};

const CONFIG_URI: &str = "http://configs.lab/tests/throughput.xml";

// ---------------------------------------------------------------------------
// In-process appliance
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Appliance {
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
    connects: AtomicUsize,
    free_interfaces: Mutex<String>,
    /// Commands containing any of these answer with an error line.
    failing: Mutex<Vec<&'static str>>,
    /// When set, `startTestGroup` blocks until a permit is added.
    start_gate: Mutex<Option<Arc<Semaphore>>>,
    start_entered: Notify,
}

impl Appliance {
    fn new() -> Arc<Self> {
        let appliance = Self::default();
        *appliance.free_interfaces.lock().unwrap() = "1/1/1 up\n1/1/2 up\n".to_string();
        Arc::new(appliance)
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }
}

struct MockSession {
    appliance: Arc<Appliance>,
}

#[async_trait]
impl ApplianceSession for MockSession {
    async fn send_command(&mut self, command: &str) -> DriverResult<String> {
        self.appliance.commands.lock().unwrap().push(command.to_string());
        if command.contains("startTestGroup") {
            let gate = self.appliance.start_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                self.appliance.start_entered.notify_one();
                gate.acquire().await.unwrap().forget();
            }
        }
        let failing = self.appliance.failing.lock().unwrap().clone();
        let reply = if failing.iter().any(|needle| command.contains(needle)) {
            "Error: test group is busy".to_string()
        } else if command.contains("listInterfaces --free") {
            self.appliance.free_interfaces.lock().unwrap().clone()
        } else if command.contains("showTestGroupState") {
            "State: Completed".to_string()
        } else if command.contains("exportTestGroupStatistics") {
            "metric,value\nthroughput_mbps,940\n".to_string()
        } else {
            "OK".to_string()
        };
        Ok(reply)
    }

    async fn upload_file(&mut self, remote_path: &str, _payload: Bytes) -> DriverResult<()> {
        self.appliance.uploads.lock().unwrap().push(remote_path.to_string());
        Ok(())
    }
}

struct MockConnector {
    appliance: Arc<Appliance>,
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self) -> DriverResult<Box<dyn ApplianceSession>> {
        self.appliance.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            appliance: self.appliance.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// In-process platform
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockPlatformState {
    reserved: Vec<ReservedPort>,
    released: Mutex<Vec<ReservedPort>>,
    attachments: Mutex<Vec<String>>,
}

struct MockPlatform {
    appliance: Arc<Appliance>,
    state: Arc<MockPlatformState>,
}

#[async_trait]
impl ReservationResources for MockPlatformState {
    async fn reserved_ports(&self, _reservation_id: &str) -> DriverResult<Vec<ReservedPort>> {
        Ok(self.reserved.clone())
    }

    async fn release_ports(&self, _reservation_id: &str, ports: &[ReservedPort]) -> DriverResult<()> {
        self.released.lock().unwrap().extend_from_slice(ports);
        Ok(())
    }
}

#[async_trait]
impl ManagementApi for MockPlatformState {
    async fn login(&self) -> DriverResult<ApiToken> {
        Ok(ApiToken {
            value: "token".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(10),
        })
    }

    async fn attach_file(
        &self,
        _token: &ApiToken,
        reservation_id: &str,
        file_name: &str,
        _payload: Bytes,
    ) -> DriverResult<String> {
        let reference = format!("reservation://{reservation_id}/attachments/{file_name}");
        self.attachments.lock().unwrap().push(reference.clone());
        Ok(reference)
    }
}

impl Platform for MockPlatform {
    fn decryptor(&self, _ctx: &CommandContext) -> DriverResult<Arc<dyn CredentialDecryptor>> {
        Ok(Arc::new(PlaintextCredentials))
    }

    fn resources(&self, _ctx: &CommandContext) -> DriverResult<Arc<dyn ReservationResources>> {
        Ok(self.state.clone())
    }

    fn management(&self, _ctx: &CommandContext) -> DriverResult<Arc<dyn ManagementApi>> {
        Ok(self.state.clone())
    }

    fn connector(&self, _resource: Arc<ResourceConfig>, _config: &DriverConfig) -> Arc<dyn SessionConnector> {
        Arc::new(MockConnector {
            appliance: self.appliance.clone(),
        })
    }
}

/// Serves a fixed payload, optionally failing the first `failures` calls.
struct ScriptedFetch {
    calls: AtomicUsize,
    failures: usize,
    failure_kind: FetchErrorKind,
}

impl ScriptedFetch {
    fn ok() -> Arc<Self> {
        Self::failing(0, FetchErrorKind::Unreachable)
    }

    fn failing(failures: usize, failure_kind: FetchErrorKind) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
            failure_kind,
        })
    }
}

#[async_trait]
impl TransferHandler for ScriptedFetch {
    async fn fetch(&self, request: &TransferRequest) -> DriverResult<Bytes> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(DriverError::fetch(self.failure_kind, &request.redacted(), "scripted failure"));
        }
        Ok(Bytes::from_static(b"<TestGroup/>"))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    driver: TrafficControllerDriver,
    appliance: Arc<Appliance>,
    platform: Arc<MockPlatformState>,
    fetch: Arc<ScriptedFetch>,
}

fn harness_with(reserved: Vec<ReservedPort>, fetch: Arc<ScriptedFetch>) -> Harness {
    let appliance = Appliance::new();
    let platform = Arc::new(MockPlatformState {
        reserved,
        ..Default::default()
    });

    let mut config = DriverConfig::default();
    config.pool.acquire_timeout_sec = 5;
    config.pool.connect_retry_delay_ms = 0;
    config.transfer.retry_delay_ms = 0;
    config.results.poll_interval_ms = 10;

    let fetcher = TransferFetcher::default().with_handler(Scheme::Http, fetch.clone());
    let driver = TrafficControllerDriver::with_fetcher(
        config,
        Arc::new(MockPlatform {
            appliance: appliance.clone(),
            state: platform.clone(),
        }),
        fetcher,
    );
    Harness {
        driver,
        appliance,
        platform,
        fetch,
    }
}

fn harness() -> Harness {
    harness_with(Vec::new(), ScriptedFetch::ok())
}

fn context(reservation_id: &str, sessions_limit: usize) -> CommandContext {
    let mut attributes = HashMap::new();
    attributes.insert(format!("{SHELL_NAME}.{ATTR_USER}"), "admin".to_string());
    attributes.insert(ATTR_PASSWORD.to_string(), "admin".to_string());
    attributes.insert(ATTR_SESSIONS_LIMIT.to_string(), sessions_limit.to_string());
    CommandContext {
        resource: ResourceDetails {
            name: "TeraVM Controller".into(),
            address: "192.0.2.10".into(),
            attributes,
        },
        reservation: Some(ReservationDetails {
            reservation_id: reservation_id.to_string(),
            domain: None,
        }),
        connectivity: Connectivity::default(),
    }
}

async fn state(h: &Harness, reservation_id: &str) -> LifecycleState {
    h.driver.registry().snapshot(reservation_id).await.unwrap().state
}

async fn is_registered(h: &Harness, reservation_id: &str) -> bool {
    h.driver.registry().snapshot(reservation_id).await.is_some()
}

fn reserved_ports() -> Vec<ReservedPort> {
    vec![
        ReservedPort {
            name: "TeraVM Chassis/Module1/Port 1".into(),
            address: "2/1/1".into(),
        },
        ReservedPort {
            name: "TeraVM Chassis/Module1/Port 2".into(),
            address: "2/1/2".into(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initialize_reports_finished() {
    let h = harness();
    let msg = h.driver.initialize(&context("R1", 2)).await.unwrap();
    assert_eq!(msg, "Finished initializing");
    assert_eq!(h.driver.pool_stats().await.unwrap().capacity, 2);
}

#[tokio::test]
async fn commands_before_initialize_fail_clearly() {
    let h = harness();
    let err = h
        .driver
        .load_config(&context("R1", 1), CONFIG_URI, "false")
        .await
        .unwrap_err();
    assert_eq!(err.kind, OperationErrorKind::Invalid);
    assert!(err.to_string().contains("not initialized"));
    assert!(h.appliance.commands().is_empty());
}

#[tokio::test]
async fn start_before_load_is_rejected() {
    let h = harness();
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();

    let err = h.driver.start_traffic(&ctx).await.unwrap_err();
    assert_eq!(err.kind, OperationErrorKind::Conflict);
    assert!(err.to_string().contains("cannot start traffic while reservation is idle"));
    assert!(h.appliance.commands().is_empty());
}

#[tokio::test]
async fn full_lifecycle() {
    let h = harness();
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();

    let msg = h.driver.load_config(&ctx, CONFIG_URI, "False").await.unwrap();
    assert!(msg.contains("loaded as test group tg-R1-"));
    assert_eq!(state(&h, "R1").await, LifecycleState::Configured);
    assert_eq!(
        *h.appliance.uploads.lock().unwrap(),
        vec!["/tmp/trafficctl/throughput.xml".to_string()]
    );
    assert_eq!(h.appliance.count("importTestGroup"), 1);
    assert_eq!(h.appliance.count("bindInterface"), 2);

    h.driver.start_traffic(&ctx).await.unwrap();
    assert_eq!(state(&h, "R1").await, LifecycleState::Running);

    let artifact = h.driver.get_statistics(&ctx).await.unwrap();
    assert!(artifact.complete);
    assert!(artifact.file_name.contains("_statistics_"));
    assert_eq!(
        artifact.attachment.as_deref(),
        h.platform.attachments.lock().unwrap().first().map(String::as_str)
    );
    // collecting results does not move the state machine
    assert_eq!(state(&h, "R1").await, LifecycleState::Running);

    assert_eq!(h.driver.stop_traffic(&ctx).await.unwrap(), "Traffic stopped");
    assert_eq!(state(&h, "R1").await, LifecycleState::Stopped);

    assert_eq!(h.driver.cleanup_reservation(&ctx).await.unwrap(), "Reservation cleaned up");
    assert!(!is_registered(&h, "R1").await);
    assert_eq!(h.appliance.count("deleteTestGroup"), 1);

    // one session, reused for every step
    assert_eq!(h.appliance.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cleanup_twice_is_harmless() {
    let h = harness();
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();
    h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap();

    h.driver.cleanup_reservation(&ctx).await.unwrap();
    let commands = h.appliance.commands().len();
    let msg = h.driver.cleanup_reservation(&ctx).await.unwrap();

    assert_eq!(msg, "Reservation already cleaned up");
    assert!(!is_registered(&h, "R1").await);
    assert_eq!(h.appliance.commands().len(), commands);

    // a cleaned reservation starts over on its next load
    h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap();
    assert_eq!(state(&h, "R1").await, LifecycleState::Configured);
}

#[tokio::test]
async fn unknown_reservations_are_not_registered() {
    let h = harness();
    let ctx = context("R0", 1);
    h.driver.initialize(&ctx).await.unwrap();

    for n in 0..100 {
        let ctx = context(&format!("unknown-{n}"), 1);
        let msg = h.driver.stop_traffic(&ctx).await.unwrap();
        assert!(msg.contains("idle"));
    }
    let err = h.driver.start_traffic(&ctx).await.unwrap_err();
    assert!(err.to_string().contains("while reservation is idle"));
    let err = h.driver.get_statistics(&ctx).await.unwrap_err();
    assert_eq!(err.kind, OperationErrorKind::Conflict);
    assert_eq!(
        h.driver.cleanup_reservation(&ctx).await.unwrap(),
        "Reservation already cleaned up"
    );

    assert_eq!(h.driver.registry().len().await, 0);
    assert!(h.appliance.commands().is_empty());

    // load registers the reservation; cleanup removes it again
    h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap();
    assert_eq!(h.driver.registry().len().await, 1);
    h.driver.cleanup_reservation(&ctx).await.unwrap();
    assert_eq!(h.driver.registry().len().await, 0);
}

#[tokio::test]
async fn stop_without_running_traffic_does_not_contact_appliance() {
    let h = harness();
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();
    h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap();

    let before = h.appliance.commands().len();
    let msg = h.driver.stop_traffic(&ctx).await.unwrap();
    assert!(msg.contains("configured"));
    assert_eq!(h.appliance.commands().len(), before);
    assert_eq!(state(&h, "R1").await, LifecycleState::Configured);

    h.driver.start_traffic(&ctx).await.unwrap();
    h.driver.stop_traffic(&ctx).await.unwrap();
    let before = h.appliance.commands().len();
    h.driver.stop_traffic(&ctx).await.unwrap();
    assert_eq!(h.appliance.commands().len(), before);
    assert_eq!(h.appliance.count("stopTestGroup"), 1);
}

#[tokio::test]
async fn reservation_ports_are_bound_and_released() {
    let reserved = reserved_ports();
    let h = harness_with(reserved.clone(), ScriptedFetch::ok());
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();
    h.driver.load_config(&ctx, CONFIG_URI, "TRUE").await.unwrap();

    assert_eq!(h.appliance.count("listInterfaces"), 0);
    assert_eq!(h.appliance.count("bindInterface"), 2);
    assert_eq!(h.appliance.count(" 2/1/2"), 1);

    h.driver.cleanup_reservation(&ctx).await.unwrap();
    assert_eq!(*h.platform.released.lock().unwrap(), reserved);
}

#[tokio::test]
async fn no_free_interfaces_is_a_resource_conflict() {
    let h = harness();
    *h.appliance.free_interfaces.lock().unwrap() = "# no free interfaces\n".to_string();
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();

    let err = h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap_err();
    assert_eq!(err.kind, OperationErrorKind::Conflict);
    assert_eq!(state(&h, "R1").await, LifecycleState::Failed);

    // a failed reservation can still be cleaned up and its group is removed
    h.driver.cleanup_reservation(&ctx).await.unwrap();
    assert_eq!(h.appliance.count("deleteTestGroup"), 1);
    assert_eq!(h.driver.pool_stats().await.unwrap().in_use, 0);
}

#[tokio::test]
async fn failed_reservation_must_be_cleaned_up_before_reload() {
    let h = harness();
    *h.appliance.free_interfaces.lock().unwrap() = "# no free interfaces\n".to_string();
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();
    h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap_err();
    assert_eq!(state(&h, "R1").await, LifecycleState::Failed);

    // interfaces are back, but the failed reservation stays terminal
    *h.appliance.free_interfaces.lock().unwrap() = "1/1/1 up\n".to_string();
    let imports = h.appliance.count("importTestGroup");
    let err = h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap_err();
    assert_eq!(err.kind, OperationErrorKind::Conflict);
    assert!(err.to_string().contains("cannot load configuration while reservation is failed"));
    assert_eq!(h.appliance.count("importTestGroup"), imports);
    assert_eq!(state(&h, "R1").await, LifecycleState::Failed);

    h.driver.cleanup_reservation(&ctx).await.unwrap();
    h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap();
    let reservation = h.driver.registry().snapshot("R1").await.unwrap();
    assert_eq!(reservation.state, LifecycleState::Configured);
    assert!(reservation.run.is_none());
    assert!(reservation.last_error.is_none());
}

#[tokio::test]
async fn cleanup_failures_are_reported_and_resources_released() {
    let reserved = reserved_ports();
    let h = harness_with(reserved.clone(), ScriptedFetch::ok());
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();
    h.driver.load_config(&ctx, CONFIG_URI, "true").await.unwrap();
    h.driver.start_traffic(&ctx).await.unwrap();

    h.appliance
        .failing
        .lock()
        .unwrap()
        .extend(["stopTestGroup", "deleteTestGroup"]);
    let msg = h.driver.cleanup_reservation(&ctx).await.unwrap();

    assert!(msg.starts_with("Reservation cleaned up with 2 warning(s)"), "{msg}");
    assert!(msg.contains("stop test group tg-R1-"));
    assert!(msg.contains("delete test group tg-R1-"));
    assert!(msg.contains("test group is busy"));
    // every step was still attempted
    assert_eq!(h.appliance.count("stopTestGroup"), 1);
    assert_eq!(h.appliance.count("deleteTestGroup"), 1);
    assert_eq!(*h.platform.released.lock().unwrap(), reserved);
    assert!(!is_registered(&h, "R1").await);
    assert_eq!(h.driver.pool_stats().await.unwrap().in_use, 0);
}

#[tokio::test]
async fn transient_fetch_failure_is_retried_once() {
    let h = harness_with(Vec::new(), ScriptedFetch::failing(1, FetchErrorKind::Unreachable));
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();

    h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap();
    assert_eq!(h.fetch.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn permanent_fetch_failure_is_not_retried() {
    let h = harness_with(Vec::new(), ScriptedFetch::failing(5, FetchErrorKind::NotFound));
    let ctx = context("R1", 1);
    h.driver.initialize(&ctx).await.unwrap();

    let err = h.driver.load_config(&ctx, CONFIG_URI, "false").await.unwrap_err();
    assert_eq!(err.kind, OperationErrorKind::Upstream);
    assert!(err.message.contains("not found"));
    assert_eq!(h.fetch.calls.load(Ordering::SeqCst), 1);
    assert_eq!(state(&h, "R1").await, LifecycleState::Failed);
    // the appliance was never touched
    assert!(h.appliance.commands().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_session_pool_serializes_appliance_access() {
    let h = Arc::new(harness());
    let r1 = context("R1", 1);
    let r2 = context("R2", 1);
    h.driver.initialize(&r1).await.unwrap();
    h.driver.load_config(&r1, CONFIG_URI, "false").await.unwrap();
    assert_eq!(state(&h, "R1").await, LifecycleState::Configured);

    let gate = Arc::new(Semaphore::new(0));
    *h.appliance.start_gate.lock().unwrap() = Some(gate.clone());

    let start = {
        let h = h.clone();
        let r1 = r1.clone();
        tokio::spawn(async move { h.driver.start_traffic(&r1).await })
    };
    h.appliance.start_entered.notified().await;

    let reload = {
        let h = h.clone();
        let r1 = r1.clone();
        tokio::spawn(async move { h.driver.load_config(&r1, CONFIG_URI, "false").await })
    };
    let other = {
        let h = h.clone();
        tokio::spawn(async move { h.driver.load_config(&r2, CONFIG_URI, "false").await })
    };

    // Both loads are parked while start holds the only session.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!reload.is_finished());
    assert!(!other.is_finished());
    assert_eq!(h.appliance.count("importTestGroup"), 1);
    assert_eq!(h.driver.pool_stats().await.unwrap().in_use, 1);

    gate.add_permits(1);
    start.await.unwrap().unwrap();

    // R2's load proceeds on the released session; R1's reload then sees Running.
    other.await.unwrap().unwrap();
    let err = reload.await.unwrap().unwrap_err();
    assert_eq!(err.kind, OperationErrorKind::Conflict);
    assert!(err.to_string().contains("while reservation is running"));

    assert_eq!(state(&h, "R1").await, LifecycleState::Running);
    assert_eq!(state(&h, "R2").await, LifecycleState::Configured);
    assert_eq!(h.appliance.count("importTestGroup"), 2);
    assert_eq!(h.appliance.connects.load(Ordering::SeqCst), 1);
}
