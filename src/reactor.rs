//! I/O reactor (spec §4.3).
//!
//! The reference crate drives its server loop and client tasks on `tokio`;
//! this keeps that substrate rather than hand-rolling a `select(2)` loop
//! over raw sockets; see `SPEC_FULL.md` §2 for the full rationale. A
//! "reactor" here is a named *group* of tasks spawned together: one
//! `recv_from` loop per registered socket plus one ticker, all sharing a
//! delegate. That group is the reactor the spec describes — the socket
//! loops are where `on_readable` dispatch happens, the ticker is where
//! `on_tick` happens, and grouping them under one spawn call is what keeps
//! the point-cloud reactor's sockets from ever being starved by a command
//! or log socket's processing, matching the "three reactors, not one"
//! rationale in spec §4.3.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::channel::ChannelKey;

/// Bounded by spec §4.3: reactors must call `on_tick` at a cadence no
/// coarser than 100 ms.
pub const MAX_TICK_PERIOD: Duration = Duration::from_millis(100);

pub trait ReactorDelegate: Send + Sync {
    /// Called with a datagram read from `key`'s socket. Must not block.
    fn on_packet(&self, key: ChannelKey, src: SocketAddr, data: &[u8]);

    /// Called at a bounded cadence regardless of socket activity.
    fn on_tick(&self, now: Instant) {
        let _ = now;
    }
}

/// One registered socket plus the key it is reachable under.
pub struct RegisteredSocket {
    pub key: ChannelKey,
    pub socket: Arc<UdpSocket>,
}

/// A running reactor group: the socket read loops and ticker spawned for
/// one logical reactor (detection / command-plane / data-plane).
pub struct Reactor {
    quit: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Reactor {
    /// Spawns one read loop per socket and a shared ticker, all dispatching
    /// to `delegate`.
    pub fn spawn(
        name: &'static str,
        sockets: Vec<RegisteredSocket>,
        delegate: Arc<dyn ReactorDelegate>,
        tick_period: Duration,
    ) -> Self {
        let tick_period = tick_period.min(MAX_TICK_PERIOD);
        let quit = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(sockets.len() + 1);

        for reg in sockets {
            let delegate = Arc::clone(&delegate);
            let quit = Arc::clone(&quit);
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                while !quit.load(Ordering::Relaxed) {
                    let recv = tokio::time::timeout(tick_period, reg.socket.recv_from(&mut buf)).await;
                    match recv {
                        Ok(Ok((len, src))) => {
                            trace!(reactor = name, %src, len, "datagram received");
                            delegate.on_packet(reg.key, src, &buf[..len]);
                        }
                        Ok(Err(err)) => {
                            debug!(reactor = name, ?err, "socket read error");
                        }
                        Err(_) => {} // timed out; loop back to check `quit`
                    }
                }
            }));
        }

        {
            let delegate = Arc::clone(&delegate);
            let quit = Arc::clone(&quit);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick_period);
                while !quit.load(Ordering::Relaxed) {
                    interval.tick().await;
                    delegate.on_tick(Instant::now());
                }
            }));
        }

        Self { quit, tasks }
    }

    /// Requests shutdown and waits for every task in this reactor to exit.
    pub async fn shutdown(mut self) {
        self.quit.store(true, Ordering::Relaxed);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
