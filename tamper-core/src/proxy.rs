use crate::{
    ca::CertificateAuthority,
    config::{ProxyConfig, ProxyMode},
    diagnostics::HookDiagnostics,
    error::ProxyError,
    exchange::{InterceptedRequest, InterceptedResponse},
    handlers::InterceptHandler,
    hooks::{HookId, HookRegistry, ResponseHook},
    json::ArrayLocator,
    patch::{self, PatchSpec},
    upstream, Result,
};
use hudsucker::{hyper::StatusCode, ProxyBuilder};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Time open connections get to finish after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long `start` waits for the engine to accept connections.
const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a proxy. Only moves forward; `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Initialized,
    Listening,
    Shutdown,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ProxyState::Initialized => "initialized",
            ProxyState::Listening => "listening",
            ProxyState::Shutdown => "shutdown",
        };
        f.write_str(state)
    }
}

struct Lifecycle {
    state: ProxyState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

/// Create a proxy for `destination_url` listening on `port`.
///
/// `name` prefixes the identity used in every log line.
pub fn new_proxy(destination_url: &str, port: u16, mode: ProxyMode, name: Option<&str>) -> Result<HttpProxy> {
    let mut config = ProxyConfig::new(destination_url, port).with_mode(mode);
    if let Some(name) = name {
        config = config.with_name(name);
    }
    HttpProxy::new(config)
}

/// A programmable interception proxy: configuration, hooks and lifecycle.
pub struct HttpProxy {
    config: ProxyConfig,
    identity: Arc<str>,
    registry: Arc<RwLock<HookRegistry>>,
    diagnostics: HookDiagnostics,
    lifecycle: Mutex<Lifecycle>,
}

impl HttpProxy {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let token = chrono::Utc::now().timestamp_millis().to_string();
        let identity = match &config.name {
            Some(name) => format!("{} {}", name, token),
            None => token,
        };

        Ok(Self {
            config,
            identity: Arc::from(identity),
            registry: Arc::new(RwLock::new(HookRegistry::new())),
            diagnostics: HookDiagnostics::default(),
            lifecycle: Mutex::new(Lifecycle {
                state: ProxyState::Initialized,
                local_addr: None,
                shutdown_tx: None,
                task: None,
            }),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Display name plus creation timestamp, or the timestamp alone.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> ProxyState {
        self.lifecycle.lock().state
    }

    /// Address the proxy is bound to while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().local_addr
    }

    /// Structured record of what the declarative hooks did.
    pub fn diagnostics(&self) -> &HookDiagnostics {
        &self.diagnostics
    }

    pub fn proxy_type(&self) -> ProxyMode {
        self.config.mode
    }

    fn port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.listen_port)
    }

    /// URL clients under test should be configured with: the destination
    /// itself in direct mode, the proxy's own address in reverse mode.
    pub fn client_endpoint_url(&self) -> String {
        match self.config.mode {
            ProxyMode::Direct => self.config.destination_url.clone(),
            ProxyMode::Reverse => format!("http://{}:{}", self.config.listen_address, self.port()),
        }
    }

    pub fn description(&self) -> String {
        format!(
            "[{} | {} proxy on http://{}:{} for {}]",
            self.identity,
            self.config.mode,
            self.config.listen_address,
            self.port(),
            self.config.destination_url
        )
    }

    /// Bind the listener and start intercepting.
    ///
    /// Fails if the proxy is already listening or has been shut down, if the
    /// listen address cannot be bound, or if the engine does not come up.
    /// On failure the state stays `Initialized`. Failures are also logged.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            ProxyState::Initialized => {}
            ProxyState::Listening => {
                return Err(ProxyError::Lifecycle(format!("{} is already listening", self.description())))
            }
            ProxyState::Shutdown => {
                return Err(ProxyError::Lifecycle(format!("{} has been shut down", self.description())))
            }
        }

        info!(
            proxy = %self.identity,
            "starting {} proxy on http://{}:{} for {}",
            self.config.mode,
            self.config.listen_address,
            self.config.listen_port,
            self.config.destination_url
        );

        let result = self.launch().await;
        if let Err(e) = &result {
            error!(proxy = %self.identity, "[proxy] error: {}", e);
        }
        result
    }

    async fn launch(&self) -> Result<()> {
        let ip: IpAddr = self.config.listen_address.parse().map_err(|e| {
            ProxyError::Configuration(format!("Invalid listen address '{}': {}", self.config.listen_address, e))
        })?;
        let requested = SocketAddr::new(ip, self.config.listen_port);

        // The engine serves this very listener, so the port cannot change hands after the check.
        let listener = std::net::TcpListener::bind(requested)
            .map_err(|source| ProxyError::Bind { addr: requested, source })?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        // Reverse mode never sees CONNECT, but the engine still requires an authority.
        let ca = match self.config.mode {
            ProxyMode::Direct => CertificateAuthority::from_source(&self.config.ca)?,
            ProxyMode::Reverse => CertificateAuthority::generate()?,
        };

        let handler = InterceptHandler::new(
            self.identity.clone(),
            self.config.mode,
            &self.config.destination_url,
            self.registry.clone(),
            self.diagnostics.clone(),
            self.config.body_limits.clone(),
        )?;

        let proxy = ProxyBuilder::new()
            .with_listener(listener)
            .with_client(upstream::build_client(self.config.accept_invalid_upstream_certs))
            .with_ca(ca.into_authority()?)
            .with_http_handler(handler)
            .build();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let identity = self.identity.clone();
        let task = tokio::spawn(async move {
            let signal = async {
                let _ = shutdown_rx.await;
            };
            proxy.start(signal).await.map_err(|e| {
                error!(proxy = %identity, "Proxy failed: {}", e);
                ProxyError::Network(e.to_string())
            })
        });

        // Let the engine run up to its accept loop before judging it.
        tokio::task::yield_now().await;
        let ready = wait_until_accepting(addr).await;
        if !ready || task.is_finished() {
            let _ = shutdown_tx.send(());
            if !task.is_finished() {
                task.abort();
                return Err(ProxyError::Network(format!(
                    "{} not accepting connections after {:?}",
                    addr, READY_TIMEOUT
                )));
            }
            return Err(match task.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) => ProxyError::Network(format!("Engine on {} stopped before serving", addr)),
                Err(e) => ProxyError::Lifecycle(format!("Proxy task failed: {}", e)),
            });
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ProxyState::Initialized {
                let _ = shutdown_tx.send(());
                task.abort();
                return Err(ProxyError::Lifecycle(format!(
                    "{} changed state to {} while starting",
                    self.identity, lifecycle.state
                )));
            }

            lifecycle.state = ProxyState::Listening;
            lifecycle.local_addr = Some(addr);
            lifecycle.shutdown_tx = Some(shutdown_tx);
            lifecycle.task = Some(task);
        }

        info!(proxy = %self.identity, "listening on port {}...", addr.port());
        Ok(())
    }

    /// Stop intercepting and release the listener. Idempotent; the proxy
    /// cannot be started again afterwards. Returns the engine's error if it
    /// stopped on its own before shutdown was requested.
    pub async fn shutdown(&self) -> Result<()> {
        info!(proxy = %self.identity, "shutting down the proxy...");

        let (shutdown_tx, task) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ProxyState::Shutdown {
                return Ok(());
            }
            lifecycle.state = ProxyState::Shutdown;
            lifecycle.local_addr = None;
            (lifecycle.shutdown_tx.take(), lifecycle.task.take())
        };

        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(());
        }

        if let Some(mut task) = task {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(engine_result)) => engine_result?,
                Ok(Err(e)) => {
                    return Err(ProxyError::Lifecycle(format!("Proxy task failed: {}", e)));
                }
                Err(_) => {
                    warn!(proxy = %self.identity, "Connections still open after {:?}, aborting", SHUTDOWN_GRACE);
                    task.abort();
                }
            }
        }

        info!(proxy = %self.identity, "proxy stopped");
        Ok(())
    }

    /// General request callback. Replaces any previous one.
    pub fn on_request<F>(&self, callback: F)
    where
        F: Fn(&mut InterceptedRequest) + Send + Sync + 'static,
    {
        self.registry.write().set_request_callback(callback);
    }

    /// Header rewriting callback. Replaces any previous one.
    pub fn on_request_header_modify<F>(&self, callback: F)
    where
        F: Fn(&mut InterceptedRequest) + Send + Sync + 'static,
    {
        self.registry.write().set_request_header_modify(callback);
    }

    /// Body rewriting callback, only called for non-empty bodies. Replaces any previous one.
    pub fn on_request_body_modify<F>(&self, callback: F)
    where
        F: Fn(&mut InterceptedRequest) + Send + Sync + 'static,
    {
        self.registry.write().set_request_body_modify(callback);
    }

    /// Append a closure to the response hook chain.
    pub fn add_on_response_hook<F>(&self, hook: F) -> HookId
    where
        F: Fn(&InterceptedRequest, &mut InterceptedResponse) + Send + Sync + 'static,
    {
        self.add_response_hook(ResponseHook::custom(hook))
    }

    pub fn add_response_hook(&self, hook: ResponseHook) -> HookId {
        self.registry.write().add_response_hook(hook)
    }

    pub fn modify_field_in_response(
        &self,
        request_url: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> HookId {
        self.add_response_hook(patch::field_replace(request_url, field, value))
    }

    pub fn modify_array_element_in_response(
        &self,
        request_url: &str,
        locator: ArrayLocator,
        property: &str,
        value: impl Into<Value>,
    ) -> HookId {
        self.add_response_hook(patch::array_element_replace(request_url, locator, property, value))
    }

    pub fn modify_element_value_in_response(
        &self,
        request_url: &str,
        locator: ArrayLocator,
        property: &str,
        nested_key: &str,
        value: impl Into<Value>,
    ) -> HookId {
        self.add_response_hook(patch::nested_element_replace(
            request_url,
            locator,
            property,
            nested_key,
            value,
        ))
    }

    pub fn modify_response_status_code(&self, request_url: &str, status: StatusCode) -> HookId {
        self.add_response_hook(patch::status_override(request_url, status))
    }

    /// Register a patch described declaratively, e.g. loaded from a scenario file.
    pub fn apply_patch(&self, spec: PatchSpec) -> Result<HookId> {
        Ok(self.add_response_hook(spec.into_hook()?))
    }

    /// Register every patch of a JSON scenario, in file order.
    /// Nothing is registered if any entry is invalid.
    pub fn load_scenario(&self, json: &str) -> Result<Vec<HookId>> {
        let hooks = PatchSpec::parse_list(json)?
            .into_iter()
            .map(PatchSpec::into_hook)
            .collect::<Result<Vec<_>>>()?;

        let mut registry = self.registry.write();
        let ids = hooks
            .into_iter()
            .map(|hook| registry.add_response_hook(hook))
            .collect::<Vec<_>>();
        info!(proxy = %self.identity, "loaded {} patches from scenario", ids.len());
        Ok(ids)
    }

    /// Remove every hook and callback, and forget recorded diagnostics.
    /// Must not be called while exchanges are in flight.
    pub fn clear_hooks(&self) {
        info!(proxy = %self.identity, "clear all hooks");
        self.registry.write().clear();
        self.diagnostics.clear();
    }
}

/// Poll `addr` until the engine's listener answers or the timeout passes.
async fn wait_until_accepting(addr: SocketAddr) -> bool {
    let target = if addr.ip().is_unspecified() {
        let loopback: IpAddr = if addr.is_ipv4() {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv6Addr::LOCALHOST.into()
        };
        SocketAddr::new(loopback, addr.port())
    } else {
        addr
    };

    let poll = async {
        while TcpStream::connect(target).await.is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(READY_TIMEOUT, poll).await.is_ok()
}

impl fmt::Display for HttpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

impl fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProxy")
            .field("identity", &self.identity)
            .field("mode", &self.config.mode)
            .field("state", &self.state())
            .finish()
    }
}
