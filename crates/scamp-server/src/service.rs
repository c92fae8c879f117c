//! The service: TLS listener, action registry, and connection lifecycle.
//!
//! A `Service` binds when it is created, accepts handlers until `run` is
//! called, then serves until `stop` or an accept error. Every accepted socket
//! gets its TLS handshake and packet router in its own task; sessions from all
//! connections share one bounded queue drained by the [`Dispatcher`].

use crate::action::{ActionTable, ServiceAction};
use crate::config::ServiceConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ServiceError, ServiceResult};
use crate::tls;
use scamp_core::{Connection, ConnectionHandle, Role, Session};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

type ConnectionSet = Arc<Mutex<HashMap<u64, ConnectionHandle>>>;

#[derive(Default)]
struct Registry {
    started: bool,
    actions: ActionTable,
}

/// One SCAMP service listening on one socket.
pub struct Service {
    name: String,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    queue_capacity: usize,
    max_concurrent_sessions: usize,
    request_timeout: Duration,
    handshake_timeout: Duration,
    keep_sessions_open: bool,
    listener: Mutex<Option<TcpListener>>,
    registry: Mutex<Registry>,
    connections: ConnectionSet,
    shutdown_tx: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Service {
    /// Load the TLS credentials for `name` and bind the listen address.
    pub async fn new(config: &ServiceConfig, name: &str) -> ServiceResult<Self> {
        let (cert, key) = match (config.cert_path(name), config.key_path(name)) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Err(ServiceError::CredentialsNotFound(name.to_string())),
        };
        let tls_config = tls::load_tls_config(&cert, &key, config.client_ca.as_deref())?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(config.listen.as_str())
            .await
            .map_err(|source| ServiceError::Listen {
                addr: config.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(service = %name, addr = %local_addr, cert = %cert.display(), "service bound");

        Ok(Self {
            name: name.to_string(),
            local_addr,
            acceptor,
            queue_capacity: config.queue_capacity.max(1),
            max_concurrent_sessions: config.max_concurrent_sessions.max(1),
            request_timeout: config.request_timeout,
            handshake_timeout: config.handshake_timeout,
            keep_sessions_open: config.keep_sessions_open,
            listener: Mutex::new(Some(listener)),
            registry: Mutex::new(Registry::default()),
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx: watch::channel(false).0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True from the start of `run` until `stop`.
    pub fn is_running(&self) -> bool {
        lock(&self.registry).started && !*self.shutdown_tx.borrow()
    }

    /// Number of connections currently tracked.
    pub fn open_connections(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        lock(&self.registry)
            .actions
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Register a handler for `name`. Only allowed before `run`.
    pub fn register(&self, name: impl Into<String>, handler: ServiceAction) -> ServiceResult<()> {
        let name = name.into();
        let mut registry = lock(&self.registry);
        if registry.started {
            return Err(ServiceError::AlreadyRunning);
        }
        if registry.actions.insert(name.clone(), handler).is_some() {
            warn!(action = %name, "replacing previously registered handler");
        } else {
            debug!(action = %name, "registered action");
        }
        Ok(())
    }

    /// Serve until [`stop`](Self::stop) is called or accepting fails.
    ///
    /// Returns `Ok(())` after a stop, `Accept` if the listener failed, and
    /// `AlreadyRunning` if `run` was already called.
    pub async fn run(&self) -> ServiceResult<()> {
        let actions = {
            let mut registry = lock(&self.registry);
            if registry.started {
                return Err(ServiceError::AlreadyRunning);
            }
            registry.started = true;
            Arc::new(registry.actions.clone())
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stopped = *shutdown_rx.borrow_and_update();
        let listener = lock(&self.listener).take();
        let listener = match listener {
            Some(listener) if !stopped => listener,
            _ => {
                info!(service = %self.name, "stopped before it started");
                return Ok(());
            }
        };

        info!(
            service = %self.name,
            addr = %self.local_addr,
            actions = ?actions.names(),
            "service running"
        );

        let (session_tx, session_rx) = mpsc::channel::<Session>(self.queue_capacity);
        let dispatcher = Dispatcher::new(actions, self.max_concurrent_sessions, self.request_timeout);
        let dispatch = tokio::spawn(dispatcher.route_sessions(session_rx));

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(service = %self.name, "accept loop stopping");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        self.spawn_connection(stream, remote, session_tx.clone(), shutdown_rx.clone());
                    }
                    Err(e) => {
                        error!(service = %self.name, error = %e, "accept failed");
                        break Err(ServiceError::Accept(e));
                    }
                }
            }
        };

        // Routers hold the only other queue senders; closing them lets the
        // dispatch loop drain and finish.
        drop(listener);
        drop(session_tx);
        self.shutdown_tx.send_replace(true);
        self.close_connections();

        if let Err(e) = dispatch.await {
            warn!(service = %self.name, error = %e, "dispatch task failed");
        }
        info!(service = %self.name, "service stopped");
        result
    }

    /// Stop accepting and close every open connection. Safe to call at any
    /// time and any number of times.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!(service = %self.name, "stopping service");
        }
        drop(lock(&self.listener).take());
        self.close_connections();
    }

    fn close_connections(&self) {
        let handles: Vec<ConnectionHandle> = lock(&self.connections).values().cloned().collect();
        let closed = handles.iter().filter(|h| h.close()).count();
        if closed > 0 {
            debug!(service = %self.name, closed, "closed open connections");
        }
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        session_tx: mpsc::Sender<Session>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let acceptor = self.acceptor.clone();
        let connections = self.connections.clone();
        let handshake_timeout = self.handshake_timeout;
        let keep_open = self.keep_sessions_open;

        tokio::spawn(async move {
            if *shutdown_rx.borrow_and_update() {
                debug!(remote = %remote, "dropping connection accepted during shutdown");
                return;
            }
            let handshake = tokio::time::timeout(handshake_timeout, acceptor.accept(stream));
            let tls_stream = tokio::select! {
                outcome = handshake => match outcome {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        warn!(remote = %remote, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        warn!(remote = %remote, "TLS handshake timed out");
                        return;
                    }
                },
                _ = shutdown_rx.changed() => {
                    debug!(remote = %remote, "TLS handshake abandoned on shutdown");
                    return;
                }
            };

            let conn = Connection::new(tls_stream, session_tx);
            let handle = conn.handle();
            let conn_id = handle.id();
            lock(&connections).insert(conn_id, handle.clone());

            // stop() may have swept the set before this entry landed
            let stopping = *shutdown_rx.borrow();
            if stopping {
                handle.close();
            }
            info!(conn_id, remote = %remote, "connection accepted");

            let result = conn.packet_router(Role::Server, keep_open).await;
            lock(&connections).remove(&conn_id);
            match result {
                Ok(()) => debug!(conn_id, remote = %remote, "connection closed"),
                Err(e) => debug!(conn_id, remote = %remote, error = %e, "connection ended with error"),
            }
        });
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.close_connections();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}
