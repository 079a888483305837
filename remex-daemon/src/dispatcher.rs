//! TCP accept loop: one Link and one fresh endpoint per connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use remex_core::{Link, LinkHandler, RemoteHandle};

use crate::config::bind_addr;
use crate::error::{io_err, DaemonError};
use crate::sink::SinkService;

/// Pending-connection backlog of the listening socket.
pub const BACKLOG: u32 = 3;

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Builds the local endpoint for a new connection, given a handle to the
/// peer on the other end.
pub type EndpointFactory = Arc<dyn Fn(RemoteHandle) -> Arc<dyn LinkHandler> + Send + Sync>;

type Links = Arc<Mutex<Vec<Arc<Link>>>>;

pub struct Dispatcher {
    host: String,
    port: u16,
    factory: EndpointFactory,
    links: Links,
    shutdown: broadcast::Sender<()>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(host: impl Into<String>, port: u16, factory: EndpointFactory) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        Self {
            host: host.into(),
            port,
            factory,
            links: Arc::new(Mutex::new(Vec::new())),
            shutdown,
            accept: Mutex::new(None),
        }
    }

    /// A dispatcher that serves `sink` to every connection.
    pub fn for_sink(host: impl Into<String>, port: u16, sink: Arc<SinkService>) -> Self {
        let factory: EndpointFactory =
            Arc::new(move |remote: RemoteHandle| -> Arc<dyn LinkHandler> { sink.endpoint(remote) });
        Self::new(host, port, factory)
    }

    /// Bind and start accepting. Returns the bound address, so port 0 picks
    /// an ephemeral port.
    pub async fn open(&self) -> Result<SocketAddr, DaemonError> {
        let addr = bind_addr(&self.host, self.port);
        let listener = listen(&addr).await?;
        let local = listener
            .local_addr()
            .map_err(|e| io_err(format!("listener {addr}"), e))?;

        let task = tokio::spawn(accept_loop(
            listener,
            self.factory.clone(),
            self.links.clone(),
            self.shutdown.subscribe(),
        ));
        if let Some(previous) = lock(&self.accept).replace(task) {
            previous.abort();
        }
        tracing::info!(addr = %local, "dispatcher listening");
        Ok(local)
    }

    /// Stop accepting and close every link. Failures are logged per link.
    pub async fn close(&self) {
        let _ = self.shutdown.send(());
        let accept = lock(&self.accept).take();
        if let Some(accept) = accept {
            if let Err(err) = accept.await {
                if !err.is_cancelled() {
                    tracing::warn!(error = %err, "accept task failed");
                }
            }
        }

        let links: Vec<Arc<Link>> = lock(&self.links).drain(..).collect();
        for link in links {
            let peer = link.remote().peer().to_string();
            if let Err(err) = link.close().await {
                tracing::warn!(peer = %peer, error = %err, "closing link failed");
            }
        }
        tracing::info!("dispatcher closed");
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        let mut links = lock(&self.links);
        links.retain(|link| !link.is_closed());
        links.len()
    }
}

async fn listen(addr: &str) -> Result<TcpListener, DaemonError> {
    let bind_err = |source: std::io::Error| DaemonError::Bind {
        addr: addr.to_string(),
        source,
    };
    let resolved: SocketAddr = tokio::net::lookup_host(addr)
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "host resolved to no address",
            ))
        })?;
    let socket = if resolved.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(resolved).map_err(bind_err)?;
    socket.listen(BACKLOG).map_err(bind_err)
}

async fn accept_failed(err: &std::io::Error) {
    tracing::warn!(error = %err, "accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn accept_loop(
    listener: TcpListener,
    factory: EndpointFactory,
    links: Links,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        accept_failed(&err).await;
                        continue;
                    }
                };
                let link = Arc::new(Link::new(stream));
                {
                    let mut registry = lock(&links);
                    registry.retain(|link| !link.is_closed());
                    registry.push(link.clone());
                }
                let endpoint = factory(link.remote());
                if let Err(err) = link.open(endpoint) {
                    tracing::warn!(peer = %peer, error = %err, "could not open link");
                    continue;
                }
                tracing::debug!(peer = %peer, "link accepted");

                let links = links.clone();
                let remote = link.remote();
                tokio::spawn(async move {
                    remote.wait_closed().await;
                    lock(&links).retain(|link| !link.is_closed());
                });
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
