//! Local port forwarding to container endpoints.
//!
//! Each tunnel runs its own task around [`PortForwarder::forward`]. Local
//! ports are probed on 127.0.0.1 before use; a bind race reallocates and
//! retries, a dropped stream reconnects with backoff, and a vanished target
//! marks the manager stale until [`TunnelManager::ensure_current`] reopens
//! everything against the new pod.

use crate::backoff::ExponentialBackoff;
use crate::debug_info::DebugInfo;
use crate::events::{EventBus, SessionEvent};
use devloop_common::ErrorCode;
use devloop_common::manifest::{Endpoint, Manifest, Protocol};
use devloop_common::remote::{ForwardSpec, PortForwarder, RemoteError, TargetRef};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const LOCAL_ADDRESS: &str = "127.0.0.1";

/// Immediate retries after a local bind race.
const MAX_BIND_RETRIES: u32 = 5;

/// A stream that stayed up this long resets the reconnect backoff.
const STABLE_STREAM: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("no free local port available{}", range.map(|(a, b)| format!(" in {a}..={b}")).unwrap_or_default())]
    PortUnavailable { range: Option<(u16, u16)> },

    #[error("no debug endpoint is declared for this component")]
    NoDebugEndpoint,

    #[error("tunnels to {target} are stale: {reason}")]
    Stale { target: String, reason: String },
}

impl TunnelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PortUnavailable { .. } => ErrorCode::TunnelPortUnavailable,
            Self::NoDebugEndpoint => ErrorCode::TunnelNoDebugEndpoint,
            Self::Stale { .. } => ErrorCode::TunnelStale,
        }
    }
}

/// An endpoint to forward, with an optional fixed local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub container: String,
    pub endpoint: Endpoint,
    pub local_port: Option<u16>,
}

impl TunnelRequest {
    /// Every endpoint of the manifest; debug endpoints only when `debug`.
    pub fn from_manifest(manifest: &Manifest, debug: bool) -> Vec<Self> {
        manifest
            .forwarded_endpoints(debug)
            .into_iter()
            .map(|(container, endpoint)| Self {
                container,
                endpoint,
                local_port: None,
            })
            .collect()
    }

    /// The first debug endpoint, forwarded to `local_port` when given.
    pub fn debug_only(manifest: &Manifest, local_port: Option<u16>) -> Result<Self, TunnelError> {
        manifest
            .forwarded_endpoints(true)
            .into_iter()
            .find(|(_, e)| e.is_debug())
            .map(|(container, endpoint)| Self {
                container,
                endpoint,
                local_port,
            })
            .ok_or(TunnelError::NoDebugEndpoint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    pub name: String,
    pub container: String,
    pub container_port: u16,
    pub protocol: Protocol,
    pub local_port: u16,
    pub debug: bool,
}

impl Tunnel {
    pub fn local_address(&self) -> String {
        format!("{LOCAL_ADDRESS}:{}", self.local_port)
    }
}

// ── Port allocation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAllocation {
    /// First free port in the configured range.
    Sequential,
    /// An OS-assigned ephemeral port.
    Random,
}

fn port_free(port: u16) -> bool {
    TcpListener::bind((LOCAL_ADDRESS, port)).is_ok()
}

fn ephemeral_port() -> Option<u16> {
    TcpListener::bind((LOCAL_ADDRESS, 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .ok()
}

#[derive(Debug)]
struct PortAllocator {
    mode: PortAllocation,
    range: (u16, u16),
    assigned: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    fn assigned(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.assigned.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn allocate(&self, fixed: Option<u16>) -> Result<u16, TunnelError> {
        if let Some(port) = fixed {
            if !self.assigned().contains(&port) && port_free(port) {
                self.assigned().insert(port);
                return Ok(port);
            }
            warn!(port, "Requested local port is unavailable, using a free port instead");
            return self.ephemeral();
        }
        match self.mode {
            PortAllocation::Random => self.ephemeral(),
            PortAllocation::Sequential => {
                let (start, end) = self.range;
                let mut assigned = self.assigned();
                let port = (start..=end)
                    .find(|p| !assigned.contains(p) && port_free(*p))
                    .ok_or(TunnelError::PortUnavailable {
                        range: Some(self.range),
                    })?;
                assigned.insert(port);
                Ok(port)
            }
        }
    }

    fn ephemeral(&self) -> Result<u16, TunnelError> {
        let mut assigned = self.assigned();
        for _ in 0..8 {
            if let Some(port) = ephemeral_port()
                && assigned.insert(port)
            {
                return Ok(port);
            }
        }
        Err(TunnelError::PortUnavailable { range: None })
    }

    /// Replace a port that lost a bind race.
    fn reallocate(&self, lost: u16) -> Result<u16, TunnelError> {
        let port = match self.mode {
            PortAllocation::Sequential => self.allocate(None),
            PortAllocation::Random => self.ephemeral(),
        }?;
        self.release(lost);
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.assigned().remove(&port);
    }

    fn clear(&self) {
        self.assigned().clear();
    }
}

// ── Manager ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct DescriptorConfig {
    dir: PathBuf,
    component: String,
    app: String,
}

#[derive(Default)]
struct Active {
    target: Option<TargetRef>,
    requests: Vec<TunnelRequest>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct TunnelManager {
    forwarder: Arc<dyn PortForwarder>,
    events: EventBus,
    allocator: Arc<PortAllocator>,
    descriptor: Option<DescriptorConfig>,
    tunnels: Arc<Mutex<Vec<Tunnel>>>,
    stale: Arc<AtomicBool>,
    active: tokio::sync::Mutex<Active>,
}

impl TunnelManager {
    pub fn new(
        forwarder: Arc<dyn PortForwarder>,
        events: EventBus,
        allocation: PortAllocation,
        port_range: (u16, u16),
    ) -> Self {
        Self {
            forwarder,
            events,
            allocator: Arc::new(PortAllocator {
                mode: allocation,
                range: port_range,
                assigned: Mutex::new(BTreeSet::new()),
            }),
            descriptor: None,
            tunnels: Arc::new(Mutex::new(Vec::new())),
            stale: Arc::new(AtomicBool::new(false)),
            active: tokio::sync::Mutex::new(Active::default()),
        }
    }

    /// Write the debug descriptor for the debug tunnel into `dir`.
    pub fn with_debug_descriptor(
        mut self,
        dir: impl Into<PathBuf>,
        component: impl Into<String>,
        app: impl Into<String>,
    ) -> Self {
        self.descriptor = Some(DescriptorConfig {
            dir: dir.into(),
            component: component.into(),
            app: app.into(),
        });
        self
    }

    fn snapshot(&self) -> MutexGuard<'_, Vec<Tunnel>> {
        self.tunnels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Currently forwarded tunnels.
    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.snapshot().clone()
    }

    /// `(local_port, container_port)` per tunnel.
    pub fn forwarded_ports(&self) -> Vec<(u16, u16)> {
        self.snapshot()
            .iter()
            .map(|t| (t.local_port, t.container_port))
            .collect()
    }

    pub fn debug_tunnel(&self) -> Option<Tunnel> {
        self.snapshot().iter().find(|t| t.debug).cloned()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Allocate local ports and start one forwarding task per request.
    pub async fn open(
        &self,
        target: &TargetRef,
        requests: Vec<TunnelRequest>,
    ) -> Result<Vec<Tunnel>, TunnelError> {
        let mut active = self.active.lock().await;
        self.shutdown(&mut active).await;

        let mut tunnels = Vec::with_capacity(requests.len());
        let mut debug_taken = false;
        for request in &requests {
            let local_port = match self.allocator.allocate(request.local_port) {
                Ok(port) => port,
                Err(e) => {
                    self.allocator.clear();
                    return Err(e);
                }
            };
            let debug = request.endpoint.is_debug() && !debug_taken;
            debug_taken |= debug;
            tunnels.push(Tunnel {
                name: request.endpoint.name.clone(),
                container: request.container.clone(),
                container_port: request.endpoint.target_port,
                protocol: request.endpoint.protocol,
                local_port,
                debug,
            });
        }
        *self.snapshot() = tunnels.clone();
        self.stale.store(false, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        for (index, tunnel) in tunnels.iter().enumerate() {
            let task = TunnelTask {
                forwarder: self.forwarder.clone(),
                target: target.clone(),
                index,
                fixed: requests[index].local_port,
                tunnels: self.tunnels.clone(),
                allocator: self.allocator.clone(),
                events: self.events.clone(),
                stale: self.stale.clone(),
                descriptor: self.descriptor.clone().filter(|_| tunnel.debug),
                cancel: cancel.child_token(),
            };
            active.tasks.push(tokio::spawn(task.run()));
        }

        info!(target = %target, count = tunnels.len(), "Tunnels opened");
        active.target = Some(target.clone());
        active.requests = requests;
        active.cancel = Some(cancel);
        Ok(tunnels)
    }

    /// Stop every tunnel and remove the debug descriptor. Safe to repeat.
    pub async fn close(&self) {
        let mut active = self.active.lock().await;
        self.shutdown(&mut active).await;
        active.target = None;
    }

    async fn shutdown(&self, active: &mut Active) {
        let Some(cancel) = active.cancel.take() else {
            return;
        };
        cancel.cancel();
        for task in active.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("Tunnel task ended abnormally: {}", e);
            }
        }
        self.snapshot().clear();
        self.allocator.clear();
        if let Some(descriptor) = &self.descriptor
            && let Err(e) = DebugInfo::remove(&descriptor.dir, &descriptor.component)
        {
            warn!("Failed to remove debug descriptor: {}", e);
        }
        debug!("Tunnels closed");
    }

    /// Reopen against `target` if the pod changed or a stream found the
    /// old target gone.
    pub async fn ensure_current(&self, target: &TargetRef) -> Result<Vec<Tunnel>, TunnelError> {
        let (current, requests) = {
            let active = self.active.lock().await;
            (active.target.clone(), active.requests.clone())
        };
        if current.as_ref() == Some(target) && !self.is_stale() {
            return Ok(self.tunnels());
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        info!(target = %target, "Target changed, reopening tunnels");
        self.open(target, requests)
            .await
            .map_err(|e| TunnelError::Stale {
                target: target.to_string(),
                reason: e.to_string(),
            })
    }
}

struct TunnelTask {
    forwarder: Arc<dyn PortForwarder>,
    target: TargetRef,
    index: usize,
    fixed: Option<u16>,
    tunnels: Arc<Mutex<Vec<Tunnel>>>,
    allocator: Arc<PortAllocator>,
    events: EventBus,
    stale: Arc<AtomicBool>,
    descriptor: Option<DescriptorConfig>,
    cancel: CancellationToken,
}

impl TunnelTask {
    fn current(&self) -> Option<Tunnel> {
        self.tunnels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(self.index)
            .cloned()
    }

    fn set_port(&self, port: u16) {
        if let Some(t) = self
            .tunnels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(self.index)
        {
            t.local_port = port;
        }
    }

    fn announce(&self, tunnel: &Tunnel) {
        info!(
            endpoint = %tunnel.name,
            "Forwarding from {} -> {}",
            tunnel.local_address(),
            tunnel.container_port
        );
        self.events.emit(SessionEvent::TunnelOpened {
            endpoint: tunnel.name.clone(),
            local_port: tunnel.local_port,
            container_port: tunnel.container_port,
            debug: tunnel.debug,
        });
        if let Some(d) = &self.descriptor {
            let info = DebugInfo::new(&d.component, &d.app, tunnel.local_port, tunnel.container_port);
            if let Err(e) = info.write(&d.dir) {
                warn!("Failed to write debug descriptor: {}", e);
            }
        }
    }

    async fn run(self) {
        let Some(mut tunnel) = self.current() else {
            return;
        };
        let mut backoff = ExponentialBackoff::for_reconnect();
        let mut bind_retries = 0;
        let mut announced = None;

        loop {
            if announced != Some(tunnel.local_port) {
                self.announce(&tunnel);
                announced = Some(tunnel.local_port);
            }
            let spec = ForwardSpec {
                container: tunnel.container.clone(),
                local_port: tunnel.local_port,
                container_port: tunnel.container_port,
                protocol: tunnel.protocol,
            };
            let started = Instant::now();
            let result = self
                .forwarder
                .forward(&self.target, &spec, self.cancel.clone())
                .await;
            if self.cancel.is_cancelled() {
                return;
            }

            match result {
                Ok(()) | Err(RemoteError::Cancelled) => return,
                Err(RemoteError::LocalPortInUse(port)) => {
                    bind_retries += 1;
                    if bind_retries > MAX_BIND_RETRIES {
                        error!(port, endpoint = %tunnel.name, "Giving up on tunnel after repeated bind failures");
                        return;
                    }
                    let next = match self.fixed {
                        Some(_) => self.allocator.ephemeral().inspect(|_| self.allocator.release(port)),
                        None => self.allocator.reallocate(port),
                    };
                    match next {
                        Ok(next) => {
                            warn!(port, next, "Local port taken, retrying");
                            tunnel.local_port = next;
                            self.set_port(next);
                        }
                        Err(e) => {
                            error!(endpoint = %tunnel.name, "{}", e);
                            return;
                        }
                    }
                }
                Err(RemoteError::TargetGone(pod)) => {
                    warn!(pod = %pod, endpoint = %tunnel.name, "Target gone, tunnel is stale");
                    self.stale.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    if started.elapsed() >= STABLE_STREAM {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    warn!(endpoint = %tunnel.name, ?delay, "Forwarding stream dropped: {}", e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_common::mock::MockPlatform;
    use tempfile::TempDir;

    fn endpoint(name: &str, port: u16) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            target_port: port,
            protocol: Protocol::Tcp,
        }
    }

    fn request(name: &str, port: u16, local: Option<u16>) -> TunnelRequest {
        TunnelRequest {
            container: "runtime".to_string(),
            endpoint: endpoint(name, port),
            local_port: local,
        }
    }

    fn manager(mock: &MockPlatform, allocation: PortAllocation) -> TunnelManager {
        TunnelManager::new(
            mock.platform().forwarder,
            EventBus::default(),
            allocation,
            (20001, 30001),
        )
    }

    async fn wait_for_forwards(mock: &MockPlatform, n: usize) {
        for _ in 0..1000 {
            if mock.active_forwards().len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {n} active forwards, got {}",
            mock.active_forwards().len()
        );
    }

    #[tokio::test]
    async fn test_open_allocates_distinct_ports_and_close_is_idempotent() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let manager = manager(&mock, PortAllocation::Random);

        let tunnels = manager
            .open(
                &target,
                vec![request("http", 3000, None), request("metrics", 9090, None)],
            )
            .await
            .unwrap();
        assert_eq!(tunnels.len(), 2);
        assert_ne!(tunnels[0].local_port, tunnels[1].local_port);
        wait_for_forwards(&mock, 2).await;

        manager.close().await;
        assert!(mock.active_forwards().is_empty());
        assert!(manager.tunnels().is_empty());
        manager.close().await;
    }

    #[tokio::test]
    async fn test_sequential_allocation_starts_at_range() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let manager = manager(&mock, PortAllocation::Sequential);

        let tunnels = manager
            .open(&target, vec![request("http", 3000, None), request("ws", 3001, None)])
            .await
            .unwrap();
        assert!(tunnels.iter().all(|t| (20001..=30001).contains(&t.local_port)));
        assert!(tunnels[0].local_port < tunnels[1].local_port);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_busy_fixed_port_falls_back() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let holder = TcpListener::bind((LOCAL_ADDRESS, 0)).unwrap();
        let busy = holder.local_addr().unwrap().port();
        let manager = manager(&mock, PortAllocation::Sequential);

        let tunnels = manager
            .open(&target, vec![request("http", 3000, Some(busy))])
            .await
            .unwrap();
        assert_ne!(tunnels[0].local_port, busy);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_bind_race_reallocates() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let free = ephemeral_port().unwrap();
        mock.occupy_local_port(free);
        let manager = manager(&mock, PortAllocation::Random);

        manager
            .open(&target, vec![request("http", 3000, Some(free))])
            .await
            .unwrap();
        wait_for_forwards(&mock, 1).await;

        let forwarded = mock.active_forwards()[0].local_port;
        assert_ne!(forwarded, free);
        assert_eq!(manager.forwarded_ports(), vec![(forwarded, 3000)]);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_reconnects() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        mock.drop_streams(3000, 2);
        let manager = manager(&mock, PortAllocation::Random);

        manager
            .open(&target, vec![request("http", 3000, None)])
            .await
            .unwrap();
        wait_for_forwards(&mock, 1).await;
        assert_eq!(mock.forward_attempts(), 3);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_target_gone_marks_stale_and_ensure_current_reopens() {
        let mock = MockPlatform::builder().target("web").build();
        let old = mock.target().unwrap();
        let manager = manager(&mock, PortAllocation::Random);
        let new = mock.recreate_target();

        manager
            .open(&old, vec![request("http", 3000, None)])
            .await
            .unwrap();
        for _ in 0..1000 {
            if manager.is_stale() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.is_stale());

        let tunnels = manager.ensure_current(&new).await.unwrap();
        assert_eq!(tunnels.len(), 1);
        assert!(!manager.is_stale());
        wait_for_forwards(&mock, 1).await;

        // Same target, nothing to do.
        let again = manager.ensure_current(&new).await.unwrap();
        assert_eq!(again, manager.tunnels());
        manager.close().await;
    }

    #[tokio::test]
    async fn test_debug_tunnel_writes_and_close_removes_descriptor() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let dir = TempDir::new().unwrap();
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let manager = TunnelManager::new(
            mock.platform().forwarder,
            bus,
            PortAllocation::Random,
            (20001, 30001),
        )
        .with_debug_descriptor(dir.path(), "nodejs", "app");

        manager
            .open(
                &target,
                vec![request("http", 3000, None), request("debug", 5858, None)],
            )
            .await
            .unwrap();
        wait_for_forwards(&mock, 2).await;

        let debug = manager.debug_tunnel().unwrap();
        assert_eq!(debug.container_port, 5858);
        let info = DebugInfo::load(dir.path(), "nodejs").unwrap().unwrap();
        assert_eq!(info.spec.local_port, debug.local_port);
        assert_eq!(info.spec.remote_port, 5858);

        let mut opened = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::TunnelOpened { container_port, .. } = event {
                opened.push(container_port);
            }
        }
        opened.sort();
        assert_eq!(opened, vec![3000, 5858]);

        manager.close().await;
        assert!(DebugInfo::load(dir.path(), "nodejs").unwrap().is_none());
    }

    #[test]
    fn test_debug_only_requires_debug_endpoint() {
        let manifest = Manifest::parse(
            r#"
name = "nodejs"
[[containers]]
name = "runtime"
endpoints = [{ name = "http", target_port = 3000 }]
"#,
            std::path::Path::new("devloop.toml"),
        )
        .unwrap();
        let err = TunnelRequest::debug_only(&manifest, Some(5005)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TunnelNoDebugEndpoint);
        assert_eq!(TunnelRequest::from_manifest(&manifest, true).len(), 1);
    }
}
