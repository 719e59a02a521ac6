//! TCP server: accepts connections and runs one session per OS thread.
//!
//! Sessions block on their own sockets; there is no event loop. All shared
//! state (catalog, tuple store, transaction manager) lives behind the
//! traffic cop; everything else is per-session and dies with its thread.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use corvus_core::tcop::TrafficCop;

use crate::session::Session;

pub struct CorvusServer {
    listener: TcpListener,
    tcop: Arc<TrafficCop>,
    max_connections: usize,
}

impl CorvusServer {
    /// Bind the listen address. Pass port 0 to let the OS pick one.
    pub fn bind(
        addr: &str,
        tcop: Arc<TrafficCop>,
        max_connections: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            tcop,
            max_connections,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails. Each accepted socket
    /// gets its own worker thread running the session loop.
    pub fn run(&self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "server listening");
        let active = Arc::new(AtomicUsize::new(0));

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.spawn_session(stream, &active),
                Err(err) => {
                    error!(error = %err, "accept error");
                }
            }
        }
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, active: &Arc<AtomicUsize>) {
        if active.load(Ordering::Acquire) >= self.max_connections {
            warn!(
                limit = self.max_connections,
                "connection limit reached, refusing client"
            );
            drop(stream);
            return;
        }
        stream.set_nodelay(true).ok();

        let tcop = Arc::clone(&self.tcop);
        let active = Arc::clone(active);
        let active_on_err = Arc::clone(&active);
        active.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name("corvus-session".to_string())
            .spawn(move || {
                Session::new(stream, tcop).run();
                active.fetch_sub(1, Ordering::AcqRel);
            });
        if let Err(err) = spawned {
            active_on_err.fetch_sub(1, Ordering::AcqRel);
            error!(error = %err, "failed to spawn session worker");
        }
    }
}
