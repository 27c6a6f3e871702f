//! Listener bootstrap.
//!
//! A [`ProxyServer`] binds every enabled listener of a task's configuration
//! and hands each accepted socket to its own [`Connection`]. Listeners fail
//! independently: one that cannot bind is marked `Failure` with a note and
//! the others keep serving.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use sluice_core::{ListenerConfig, ListenerState, StatusEvent};

use crate::connection::Connection;
use crate::error::{ListenerError, Result};
use crate::task::Task;

/// Pending connections the kernel queues per listener.
const BACKLOG: i32 = 1024;

/// Observable state of one configured listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    pub name: String,
    /// Address from the configuration.
    pub address: SocketAddr,
    /// Address actually bound, while running.
    pub local_addr: Option<SocketAddr>,
    pub state: ListenerState,
    pub note: Option<String>,
}

impl ListenerStatus {
    fn new(config: &ListenerConfig) -> Self {
        Self {
            name: config.name.clone(),
            address: config.socket_addr(),
            local_addr: None,
            state: ListenerState::None,
            note: None,
        }
    }
}

/// Accepts client connections on the configured listeners.
pub struct ProxyServer {
    task: Arc<Task>,
    statuses: Arc<Mutex<Vec<ListenerStatus>>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(task: Arc<Task>) -> Self {
        let statuses = task.config().listeners.iter().map(ListenerStatus::new).collect();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            task,
            statuses: Arc::new(Mutex::new(statuses)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Binds every enabled listener. Succeeds when at least one is serving.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(ListenerError::AlreadyRunning.into());
        }

        let configs: Vec<ListenerConfig> = self.task.config().enabled_listeners().cloned().collect();
        let mut started = 0;
        for config in &configs {
            match self.start_listener(config) {
                Ok(addr) => {
                    tracing::info!(listener = %config.name, %addr, "listening");
                    started += 1;
                }
                Err(e) => tracing::warn!(listener = %config.name, "listener failed: {}", e),
            }
        }

        if started == 0 {
            return Err(ListenerError::NoListeners.into());
        }
        Ok(())
    }

    /// Binds one listener and spawns its accept loop.
    pub fn start_listener(&self, config: &ListenerConfig) -> Result<SocketAddr> {
        let addr = config.socket_addr();
        let listener = match bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                let note = e.to_string();
                self.set_state(&config.name, ListenerState::Failure, None, Some(note));
                return Err(ListenerError::Bind(addr, e).into());
            }
        };
        let local_addr = listener.local_addr().map_err(|e| ListenerError::Bind(addr, e))?;
        self.set_state(&config.name, ListenerState::Running, Some(local_addr), None);

        let accept = AcceptLoop {
            name: config.name.clone(),
            listener,
            task: self.task.clone(),
            statuses: self.statuses.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        self.handles.lock().push(tokio::spawn(accept.run()));
        Ok(local_addr)
    }

    /// Closes every listener and aborts in-flight connections. Calling it
    /// again is a no-op.
    pub async fn stop(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        let _ = self.shutdown_tx.send(());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("accept loop ended abnormally: {}", e);
            }
        }
        tracing::info!("proxy stopped");
    }

    /// Stops everything, waits for connections to wind down and starts
    /// again with the same configuration.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    pub fn statuses(&self) -> Vec<ListenerStatus> {
        self.statuses.lock().clone()
    }

    /// Bound addresses of the running listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.statuses
            .lock()
            .iter()
            .filter(|s| s.state == ListenerState::Running)
            .filter_map(|s| s.local_addr)
            .collect()
    }

    fn set_state(&self, name: &str, state: ListenerState, local_addr: Option<SocketAddr>, note: Option<String>) {
        set_state(&self.statuses, &self.task, name, state, local_addr, note);
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

struct AcceptLoop {
    name: String,
    listener: TcpListener,
    task: Arc<Task>,
    statuses: Arc<Mutex<Vec<ListenerStatus>>>,
    shutdown: broadcast::Receiver<()>,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, "set_nodelay failed: {}", e);
                        }
                        self.task.counters().connection_opened();
                        connections.spawn(Connection::new(self.task.clone(), Some(peer)).run(stream));
                    }
                    Err(e) => {
                        tracing::warn!(listener = %self.name, "accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        let aborted = connections.len();
        connections.shutdown().await;
        tracing::debug!(listener = %self.name, aborted, "listener closed");
        set_state(&self.statuses, &self.task, &self.name, ListenerState::Closed, None, None);
    }
}

fn set_state(
    statuses: &Mutex<Vec<ListenerStatus>>,
    task: &Task,
    name: &str,
    state: ListenerState,
    local_addr: Option<SocketAddr>,
    note: Option<String>,
) {
    let address = {
        let mut statuses = statuses.lock();
        let Some(status) = statuses.iter_mut().find(|s| s.name == name) else {
            return;
        };
        status.state = state;
        status.local_addr = local_addr;
        status.note = note.clone();
        status.address
    };
    task.notifier()
        .notify(StatusEvent::listener(name, address.to_string(), state, note));
}

/// Binds a reusable listening socket.
fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    let listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(listener)
}
