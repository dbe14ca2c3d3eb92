//! Shared fixtures for the service integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use et_core::config::{IdentityRecord, PersistedState, ServiceConfig, StateStore};
use et_core::engine::{
    EngineHandle, EnrolledCredential, EnrollmentRequest, IdentityConfig, ServiceChange,
    TunnelEngine,
};
use et_core::error::EngineError;
use et_core::ipc::{Command, Event, Response};
use et_core::netconfig::NetworkConfigurator;
use et_core::types::Address;
use et_core::{Fingerprint, Service, TransferMetrics};
use et_service::{RunningService, TunnelService};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunnel engine double that records every call
pub struct FakeEngine {
    certificate: Vec<u8>,
    fail_enroll: AtomicBool,
    services: Mutex<HashMap<Fingerprint, Vec<Service>>>,
    calls: Mutex<Vec<String>>,
    changes: mpsc::UnboundedSender<ServiceChange>,
}

impl FakeEngine {
    pub fn new(certificate: &[u8]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            certificate: certificate.to_vec(),
            fail_enroll: AtomicBool::new(false),
            services: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            changes: tx,
        });
        (engine, rx)
    }

    /// Services a handle for `fingerprint` starts with
    pub fn set_services(&self, fingerprint: &str, services: Vec<Service>) {
        self.services
            .lock()
            .unwrap()
            .insert(Fingerprint::new(fingerprint), services);
    }

    pub fn fail_enrollment(&self) {
        self.fail_enroll.store(true, Ordering::SeqCst);
    }

    /// Report a service change the way a live engine would
    pub fn emit(&self, change: ServiceChange) {
        self.changes.send(change).unwrap();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TunnelEngine for FakeEngine {
    async fn enroll(&self, request: EnrollmentRequest) -> Result<EnrolledCredential, EngineError> {
        self.record(format!("enroll {}", request.name));
        if self.fail_enroll.load(Ordering::SeqCst) {
            return Err(EngineError::Enrollment("controller rejected the token".to_string()));
        }
        Ok(EnrolledCredential {
            controller: request.token.controller().to_string(),
            controller_version: Some("v1.2.3".to_string()),
            certificate_der: self.certificate.clone(),
            document: serde_json::json!({
                "ztAPI": request.token.controller(),
                "id": { "key": "pem:PRIVATE KEY", "cert": "pem:CERT" },
            }),
        })
    }

    async fn connect(&self, identity: &IdentityConfig) -> Result<EngineHandle, EngineError> {
        self.record(format!("connect {}", identity.fingerprint));
        let handle = EngineHandle::new(identity.fingerprint.clone());
        let services = self
            .services
            .lock()
            .unwrap()
            .get(&identity.fingerprint)
            .cloned()
            .unwrap_or_default();
        for service in services {
            handle.insert_service(service);
        }
        Ok(handle)
    }

    async fn disconnect(&self, handle: EngineHandle) -> Result<(), EngineError> {
        self.record(format!("disconnect {}", handle.fingerprint()));
        Ok(())
    }

    async fn remove_intercept(
        &self,
        fingerprint: &Fingerprint,
        service: &Service,
    ) -> Result<(), EngineError> {
        self.record(format!("remove_intercept {} {}", fingerprint, service.id));
        Ok(())
    }

    fn dump(&self, handle: &EngineHandle) -> Result<String, EngineError> {
        Ok(format!("dump of {}\n", handle.fingerprint()))
    }

    fn metrics(&self, _handle: &EngineHandle) -> TransferMetrics {
        TransferMetrics { up: 10, down: 20 }
    }
}

/// Network configurator double that records resolver changes
#[derive(Default)]
pub struct FakeNetwork {
    upstreams: Vec<IpAddr>,
    domains: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn with_domains(domains: &[&str]) -> Self {
        Self {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkConfigurator for FakeNetwork {
    async fn upstream_resolvers(&self) -> io::Result<Vec<IpAddr>> {
        Ok(self.upstreams.clone())
    }

    async fn connection_specific_domains(&self) -> io::Result<Vec<String>> {
        Ok(self.domains.clone())
    }

    async fn set_resolvers(&self, resolvers: &[IpAddr]) -> io::Result<()> {
        self.calls.lock().unwrap().push(format!("set {:?}", resolvers));
        Ok(())
    }

    async fn reset_resolvers(&self) -> io::Result<()> {
        self.calls.lock().unwrap().push("reset".to_string());
        Ok(())
    }
}

/// Configuration bound to loopback ephemeral ports inside `dir`
pub fn test_config(dir: &Path) -> ServiceConfig {
    ServiceConfig {
        storage_dir: dir.to_path_buf(),
        log_file: dir.join("logs").join("service.log"),
        ipc_address: "127.0.0.1:0".to_string(),
        events_address: "127.0.0.1:0".to_string(),
        logs_address: "127.0.0.1:0".to_string(),
        dns_addresses: vec!["127.0.0.1".parse().unwrap()],
        dns_port: 0,
        metrics_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_millis(50),
        ..ServiceConfig::default()
    }
}

pub fn identity_record(name: &str, fingerprint: &str, active: bool) -> IdentityRecord {
    IdentityRecord {
        name: name.to_string(),
        fingerprint: Fingerprint::new(fingerprint),
        active,
        controller: "https://ctrl.example.com:1280".to_string(),
        controller_version: "v1.0.0".to_string(),
    }
}

/// A service intercepting `hostname`, reachable at `ip` through the tunnel
pub fn hostname_service(id: &str, hostname: &str, ip: &str) -> Service {
    Service {
        id: id.to_string(),
        name: format!("svc-{}", id),
        protocols: vec!["tcp".to_string()],
        addresses: vec![Address::host(hostname)],
        owns_intercept: true,
        assigned_ip: Some(ip.parse().unwrap()),
        ..Default::default()
    }
}

/// Enrollment token with the given issuer and no expiry
pub fn enrollment_token(issuer: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "em": "ott", "iss": issuer, "jti": "token-1", "sub": "identity-1" })
            .to_string(),
    );
    let signature = URL_SAFE_NO_PAD.encode(b"signature");
    format!("{}.{}.{}", header, claims, signature)
}

/// A running service with its fakes and temp directory
pub struct Harness {
    pub service: RunningService,
    pub engine: Arc<FakeEngine>,
    pub network: Arc<FakeNetwork>,
    pub dir: TempDir,
}

pub struct HarnessBuilder {
    dir: TempDir,
    config: ServiceConfig,
    state: Option<PersistedState>,
    certificate: Vec<u8>,
    services: Vec<(String, Vec<Service>)>,
    network: FakeNetwork,
    upstreams: Vec<SocketAddr>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        Self {
            dir,
            config,
            state: None,
            certificate: b"test certificate".to_vec(),
            services: Vec::new(),
            network: FakeNetwork::default(),
            upstreams: Vec::new(),
        }
    }

    pub fn config(mut self, edit: impl FnOnce(&mut ServiceConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn state(mut self, state: PersistedState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn certificate(mut self, certificate: &[u8]) -> Self {
        self.certificate = certificate.to_vec();
        self
    }

    pub fn services(mut self, fingerprint: &str, services: Vec<Service>) -> Self {
        self.services.push((fingerprint.to_string(), services));
        self
    }

    pub fn network(mut self, network: FakeNetwork) -> Self {
        self.network = network;
        self
    }

    pub fn upstreams(mut self, upstreams: Vec<SocketAddr>) -> Self {
        self.upstreams = upstreams;
        self
    }

    pub async fn start(self) -> Harness {
        if let Some(state) = &self.state {
            StateStore::new(self.config.state_path()).save(state).unwrap();
        }

        let (engine, changes) = FakeEngine::new(&self.certificate);
        for (fingerprint, services) in self.services {
            engine.set_services(&fingerprint, services);
        }
        let network = Arc::new(self.network);

        let service = TunnelService::new(
            self.config,
            Arc::clone(&engine) as Arc<dyn TunnelEngine>,
            Arc::clone(&network) as Arc<dyn NetworkConfigurator>,
        )
        .with_service_changes(changes)
        .with_dns_upstreams(self.upstreams)
        .start()
        .await
        .expect("service failed to start");

        Harness {
            service,
            engine,
            network,
            dir: self.dir,
        }
    }
}

impl Harness {
    pub async fn control(&self) -> TestClient {
        TestClient::connect(self.service.control_addr()).await
    }

    pub async fn events(&self) -> EventClient {
        EventClient::connect(self.service.events_addr()).await
    }

    pub fn persisted(&self) -> PersistedState {
        StateStore::new(self.dir.path().join("config.json"))
            .load()
            .unwrap()
    }

    pub fn state_file_exists(&self) -> bool {
        self.dir.path().join("config.json").exists()
    }
}

/// Control channel client
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl TestClient {
    pub async fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address)
            .await
            .expect("Failed to connect to control channel");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("Failed to write request");
        self.writer.flush().await.expect("Failed to flush");
    }

    pub async fn read_response(&mut self) -> Response {
        let mut line = String::new();
        timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for a response")
            .expect("Failed to read response");
        if line.is_empty() {
            panic!("Server sent empty response (connection closed?)");
        }
        serde_json::from_str(&line).expect("Failed to parse response")
    }

    pub async fn send(&mut self, command: Command) -> Response {
        let line = serde_json::to_string(&command.to_msg()).unwrap();
        self.send_line(&line).await;
        self.read_response().await
    }

    pub async fn add_identity(&mut self, jwt: &str, name: &str) -> Response {
        self.send_line(r#"{"Function":"AddIdentity"}"#).await;
        let payload = serde_json::json!({ "Flags": { "JwtString": jwt }, "Id": { "Name": name } });
        self.send_line(&payload.to_string()).await;
        self.read_response().await
    }
}

/// Event channel client
pub struct EventClient {
    reader: BufReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
}

impl EventClient {
    pub async fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address)
            .await
            .expect("Failed to connect to event channel");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            _writer: writer,
        }
    }

    pub async fn next(&mut self) -> Event {
        let mut line = String::new();
        timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for an event")
            .expect("Failed to read event");
        if line.is_empty() {
            panic!("Event channel closed");
        }
        serde_json::from_str(&line).expect("Failed to parse event")
    }

    /// Next event that is not a periodic metrics event
    pub async fn next_change(&mut self) -> Event {
        loop {
            match self.next().await {
                Event::Metrics { .. } => continue,
                event => return event,
            }
        }
    }

    /// Read until the channel closes, returning everything received
    pub async fn drain(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let mut line = String::new();
            match timeout(READ_TIMEOUT, self.reader.read_line(&mut line)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(_)) => events.push(serde_json::from_str(&line).expect("Failed to parse event")),
            }
        }
        events
    }
}
