//! View authority daemon: serves heartbeats and view queries over TCP.

use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::authority::{View, ViewNum, ViewTracker};
use crate::utils::{recv_msg, send_msg, tcp_bind_with_retry, ViewKvError};

/// Request to the view authority.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlRequest {
    /// Replica heartbeat, advertising the highest view number the replica
    /// has installed so far.
    Ping { server: String, view_num: ViewNum },

    /// Read-only view query, used by clients to locate the primary.
    GetView,
}

/// Reply from the view authority: a snapshot of the current view.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CtrlReply {
    pub view: View,
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    /// A replica missing heartbeats for this long is declared dead.
    pub dead_interval_ms: u64,

    /// Interval of the failure-detection tick.
    pub tick_interval_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for AuthorityConfig {
    fn default() -> Self {
        AuthorityConfig {
            dead_interval_ms: 1500,
            tick_interval_ms: 500,
        }
    }
}

/// Standalone view authority daemon.
pub struct ViewAuthority {
    /// Actual bound address of the listening socket.
    addr: SocketAddr,

    /// Configuration parameters struct.
    config: AuthorityConfig,

    /// View progression state machine.
    tracker: ViewTracker,

    /// Receiver side of the request channel, fed by servant tasks.
    rx_req: mpsc::UnboundedReceiver<(CtrlRequest, oneshot::Sender<CtrlReply>)>,

    /// Join handle of the connection acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl ViewAuthority {
    /// Creates a new view authority daemon, binds the listening socket, and
    /// spawns the connection acceptor task.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, ViewKvError> {
        let config = parsed_config!(config_str => AuthorityConfig;
                                    dead_interval_ms, tick_interval_ms)?;
        if config.dead_interval_ms == 0 {
            return logged_err!(
                "va";
                "invalid config.dead_interval_ms '{}'",
                config.dead_interval_ms
            );
        }
        if config.tick_interval_ms == 0 {
            return logged_err!(
                "va";
                "invalid config.tick_interval_ms '{}'",
                config.tick_interval_ms
            );
        }

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let addr = listener.local_addr()?;

        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, tx_req));

        pf_info!("va"; "view authority listening on '{}'", addr);
        Ok(ViewAuthority {
            addr,
            tracker: ViewTracker::new(Duration::from_millis(
                config.dead_interval_ms,
            )),
            config,
            rx_req,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Actual bound address of the daemon's listening socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Main event loop. Breaks out only upon a termination signal.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ViewKvError> {
        let mut ticker = time::interval(Duration::from_millis(
            self.config.tick_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                // request relayed from a servant task
                req = self.rx_req.recv() => {
                    match req {
                        Some((req, tx_reply)) => self.handle_req(req, tx_reply),
                        None => return logged_err!("va"; "request channel closed"),
                    }
                },

                // failure-detection tick
                _ = ticker.tick() => {
                    if let Some(view) = self.tracker.tick(Instant::now()) {
                        pf_info!("va"; "view advanced to {}", view);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("va"; "view authority caught termination signal");
                    return Ok(());
                },
            }
        }
    }

    /// Synthesized handler of authority requests.
    fn handle_req(
        &mut self,
        req: CtrlRequest,
        tx_reply: oneshot::Sender<CtrlReply>,
    ) {
        let view = match req {
            CtrlRequest::Ping { server, view_num } => {
                pf_trace!("va"; "ping <- '{}' @ {}", server, view_num);
                self.tracker.handle_ping(&server, view_num, Instant::now())
            }
            CtrlRequest::GetView => self.tracker.current_view(),
        };

        if tx_reply.send(CtrlReply { view }).is_err() {
            pf_debug!("va"; "reply receiver dropped early");
        }
    }
}

// ViewAuthority acceptor & servant task implementations
impl ViewAuthority {
    /// Connection acceptor task function. Exits when the daemon (the request
    /// channel receiver) is gone, releasing the listening socket.
    async fn acceptor_task(
        listener: TcpListener,
        tx_req: mpsc::UnboundedSender<(
            CtrlRequest,
            oneshot::Sender<CtrlReply>,
        )>,
    ) {
        pf_debug!("va"; "acceptor task spawned");

        loop {
            tokio::select! {
                () = tx_req.closed() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        pf_debug!("va"; "accepted connection from '{}'", peer);
                        tokio::spawn(Self::servant_task(
                            stream,
                            peer,
                            tx_req.clone(),
                        ));
                    }
                    Err(e) => {
                        pf_warn!("va"; "error accepting connection: {}", e);
                    }
                },
            }
        }

        pf_debug!("va"; "acceptor task exited");
    }

    /// Per-connection servant task function: strictly alternating
    /// request/reply service of one peer.
    async fn servant_task(
        mut stream: TcpStream,
        peer: SocketAddr,
        tx_req: mpsc::UnboundedSender<(
            CtrlRequest,
            oneshot::Sender<CtrlReply>,
        )>,
    ) {
        loop {
            let req = match recv_msg::<CtrlRequest, _>(&mut stream).await {
                Ok(req) => req,
                Err(_) => {
                    pf_debug!("va"; "connection from '{}' closed", peer);
                    break;
                }
            };

            let (tx_reply, rx_reply) = oneshot::channel();
            if tx_req.send((req, tx_reply)).is_err() {
                break; // daemon event loop has exited
            }
            let reply = match rx_reply.await {
                Ok(reply) => reply,
                Err(_) => break,
            };

            if let Err(e) = send_msg(&mut stream, &reply).await {
                pf_debug!("va"; "error replying to '{}': {}", peer, e);
                break;
            }
        }
    }
}
