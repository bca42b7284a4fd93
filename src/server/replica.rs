//! Replica server: serves clients as primary, mirrors the primary as
//! backup, and follows the authority's view sequence.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::authority::{View, ViewNum};
use crate::server::control::heartbeat_task;
use crate::server::{ApiReply, ApiRequest, PeerStub, Role, Store, StoreDump};
use crate::utils::{recv_msg, send_msg, tcp_bind_with_retry, ViewKvError};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Interval between heartbeats to the view authority.
    pub ping_interval_ms: u64,

    /// Timeout applied to every outbound RPC (heartbeats, forwarded writes,
    /// store transfers). A hung peer is treated the same as a dead one.
    pub rpc_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            ping_interval_ms: 500,
            rpc_timeout_ms: 200,
        }
    }
}

/// Completion report of a spawned store transfer.
#[derive(Debug)]
struct SyncOutcome {
    /// The backup the snapshot was sent to.
    backup: String,

    /// True if the backup installed the snapshot.
    ok: bool,
}

/// Replica server daemon.
pub struct KvReplica {
    /// My name: the string form of my bound address.
    me: String,

    /// Actual bound address of the listening socket.
    addr: SocketAddr,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// Latest view learned from the authority.
    view: View,

    /// Role the latest view dictates for me.
    role: Role,

    /// The local key-value store.
    store: Store,

    /// The backup that received my last successful store transfer. A view
    /// naming a different backup triggers a fresh transfer.
    last_backup: Option<String>,

    /// True while a snapshot is in flight to a new backup.
    syncing: bool,

    /// Writes accepted (and acknowledged) while syncing, applied in arrival
    /// order once the snapshot lands.
    pending_puts: VecDeque<(String, String)>,

    /// Cached connection to the current backup.
    backup_stub: Option<PeerStub>,

    /// Receiver side of the request channel, fed by servant tasks.
    rx_api: mpsc::UnboundedReceiver<(ApiRequest, oneshot::Sender<ApiReply>)>,

    /// Receiver side of the view channel, fed by the heartbeat task.
    rx_view: mpsc::UnboundedReceiver<View>,

    /// Sender side of the view-number watch read by the heartbeat task.
    tx_view_num: watch::Sender<ViewNum>,

    /// Transfer outcome channel connecting spawned transfer tasks back to
    /// the event loop.
    tx_sync: mpsc::UnboundedSender<SyncOutcome>,
    rx_sync: mpsc::UnboundedReceiver<SyncOutcome>,

    /// Join handle of the connection acceptor task.
    _acceptor_handle: JoinHandle<()>,

    /// Join handle of the heartbeat task.
    _heartbeat_handle: JoinHandle<()>,
}

impl KvReplica {
    /// Creates a new replica daemon: binds the listening socket, then spawns
    /// the connection acceptor task and the heartbeat task. Does not wait
    /// for the authority to be reachable.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        authority: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, ViewKvError> {
        let config = parsed_config!(config_str => ReplicaConfig;
                                    ping_interval_ms, rpc_timeout_ms)?;
        if config.ping_interval_ms == 0 {
            return logged_err!(
                "s";
                "invalid config.ping_interval_ms '{}'",
                config.ping_interval_ms
            );
        }
        if config.rpc_timeout_ms == 0 {
            return logged_err!(
                "s";
                "invalid config.rpc_timeout_ms '{}'",
                config.rpc_timeout_ms
            );
        }

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let addr = listener.local_addr()?;
        let me = addr.to_string();

        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(me.clone(), listener, tx_api));

        let (tx_view_num, rx_view_num) = watch::channel(0);
        let (tx_view, rx_view) = mpsc::unbounded_channel();
        let heartbeat_handle = tokio::spawn(heartbeat_task(
            me.clone(),
            authority,
            Duration::from_millis(config.ping_interval_ms),
            Duration::from_millis(config.rpc_timeout_ms),
            rx_view_num,
            tx_view,
        ));

        let (tx_sync, rx_sync) = mpsc::unbounded_channel();

        pf_info!(me; "replica listening on '{}'", addr);
        Ok(KvReplica {
            me,
            addr,
            config,
            view: View::initial(),
            role: Role::Idle,
            store: Store::new(),
            last_backup: None,
            syncing: false,
            pending_puts: VecDeque::new(),
            backup_stub: None,
            rx_api,
            rx_view,
            tx_view_num,
            tx_sync,
            rx_sync,
            _acceptor_handle: acceptor_handle,
            _heartbeat_handle: heartbeat_handle,
        })
    }

    /// My name, i.e. the string form of my bound address.
    pub fn name(&self) -> &str {
        &self.me
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
        loop {
            tokio::select! {
                // request relayed from a servant task
                req = self.rx_api.recv() => {
                    match req {
                        Some((req, tx_reply)) => {
                            self.handle_api_req(req, tx_reply).await;
                        }
                        None => {
                            return logged_err!(self.me;
                                               "api channel closed");
                        }
                    }
                },

                // view returned by a heartbeat
                view = self.rx_view.recv() => {
                    match view {
                        Some(view) => self.handle_view(view),
                        None => {
                            return logged_err!(self.me;
                                               "view channel closed");
                        }
                    }
                },

                // store transfer completion
                outcome = self.rx_sync.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_sync_outcome(outcome).await;
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.me; "replica caught termination signal");
                    return Ok(());
                },
            }
        }
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }
}

// KvReplica client/peer request handlers
impl KvReplica {
    /// Synthesized handler of replica requests.
    async fn handle_api_req(
        &mut self,
        req: ApiRequest,
        tx_reply: oneshot::Sender<ApiReply>,
    ) {
        let reply = match req {
            ApiRequest::Get { key } => self.handle_get(&key),
            ApiRequest::Put { key, value } => {
                self.handle_put(key, value).await
            }
            ApiRequest::ForwardUpdate { key, value } => {
                self.handle_forward_update(key, value)
            }
            ApiRequest::SyncState { data, view_num } => {
                self.handle_sync_state(data, view_num)
            }
            ApiRequest::Dump => self.handle_dump(),
        };

        if tx_reply.send(reply).is_err() {
            pf_debug!(self.me; "reply receiver dropped early");
        }
    }

    /// Handler of client Get: primary only, no replication needed.
    fn handle_get(&self, key: &str) -> ApiReply {
        if self.role != Role::Primary {
            return ApiReply::NotPrimary;
        }
        match self.store.get(key) {
            Some(value) => ApiReply::Value {
                value: value.clone(),
            },
            None => ApiReply::NoKey,
        }
    }

    /// Handler of client Put: primary only. While a store transfer is in
    /// flight the write is queued and acknowledged right away; the snapshot
    /// predates it, so the backup will still see it as a forwarded write
    /// after installing.
    async fn handle_put(&mut self, key: String, value: String) -> ApiReply {
        if self.role != Role::Primary {
            return ApiReply::NotPrimary;
        }

        if self.syncing {
            self.pending_puts.push_back((key, value));
            pf_debug!(self.me; "queued write during transfer ({} pending)",
                               self.pending_puts.len());
            return ApiReply::Ok;
        }

        self.forward_then_apply(key, value).await;
        ApiReply::Ok
    }

    /// Relays one write to the current backup (if any), then applies it
    /// locally. Forwarding failures are swallowed: the authority decides
    /// backup liveness and will repair through a view change.
    async fn forward_then_apply(&mut self, key: String, value: String) {
        if let Some(backup) = self.view.backup.clone() {
            if let Err(e) = self.forward_to_backup(&backup, &key, &value).await
            {
                pf_warn!(self.me; "forwarding to backup '{}' failed: {}",
                                  backup, e);
                self.backup_stub = None;
            }
        }
        self.store.put(key, value);
    }

    /// Issues one ForwardUpdate call to the named backup, dialing a fresh
    /// connection if none is cached.
    async fn forward_to_backup(
        &mut self,
        backup: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ViewKvError> {
        if self.backup_stub.is_none() {
            self.backup_stub = Some(
                PeerStub::connect(backup.to_string(), self.rpc_timeout())
                    .await?,
            );
        }
        let timeout = self.rpc_timeout();
        let stub = match self.backup_stub {
            Some(ref mut stub) => stub,
            None => return Ok(()),
        };

        let req = ApiRequest::ForwardUpdate {
            key: key.to_string(),
            value: value.to_string(),
        };
        let reply = stub.call(&req, timeout).await?;
        if reply == ApiReply::NotPrimary {
            // the backup has not learned its role yet; the authority's view
            // sequence will reconcile us
            pf_debug!(self.me; "backup '{}' not yet aware of its role",
                               backup);
        }
        Ok(())
    }

    /// Handler of ForwardUpdate from the primary: backup only.
    fn handle_forward_update(&mut self, key: String, value: String) -> ApiReply {
        if self.role != Role::Backup {
            return ApiReply::NotPrimary;
        }
        self.store.put(key, value);
        ApiReply::Ok
    }

    /// Handler of SyncState from the primary: installs the snapshot
    /// wholesale.
    fn handle_sync_state(
        &mut self,
        data: HashMap<String, String>,
        view_num: ViewNum,
    ) -> ApiReply {
        pf_info!(self.me; "installing snapshot of {} keys (view {})",
                          data.len(), view_num);
        self.store.install(data);
        ApiReply::Ok
    }

    /// Handler of the diagnostics Dump request.
    fn handle_dump(&self) -> ApiReply {
        ApiReply::Dump(StoreDump {
            view: self.view.clone(),
            role: self.role,
            syncing: self.syncing,
            store: self.store.snapshot(),
        })
    }
}

// KvReplica view transition & store transfer implementation
impl KvReplica {
    /// Installs a newer view learned from the authority and reacts to the
    /// role it dictates. Views arriving out of order or repeated are
    /// ignored; the sequence each replica observes is monotone.
    fn handle_view(&mut self, view: View) {
        if view.number <= self.view.number {
            return;
        }
        pf_info!(self.me; "view changed: {} -> {}", self.view, view);

        let old_role = self.role;
        self.view = view;
        self.role = Role::of(&self.view, &self.me);
        if let Err(e) = self.tx_view_num.send(self.view.number) {
            pf_error!(self.me; "error updating advertised view: {}", e);
        }
        if self.role != old_role {
            pf_info!(self.me; "role changed: {} -> {}", old_role, self.role);
        }

        // a cached relay connection to a replaced backup is useless now
        let stub_stale = self
            .backup_stub
            .as_ref()
            .is_some_and(|stub| !self.view.backup_is(&stub.name));
        if stub_stale {
            self.backup_stub = None;
        }

        if self.role == Role::Primary {
            match self.view.backup.clone() {
                Some(backup)
                    if !self.syncing
                        && self.last_backup.as_deref()
                            != Some(backup.as_str()) =>
                {
                    self.begin_store_transfer(backup);
                }
                None => {
                    self.last_backup = None;
                }
                _ => {}
            }
        }
    }

    /// Kicks off a store transfer to a newly designated backup: snapshots
    /// the store, marks syncing, and spawns the transfer task. Writes
    /// arriving from here on queue up until the outcome comes back.
    fn begin_store_transfer(&mut self, backup: String) {
        self.syncing = true;
        pf_info!(self.me; "transferring {} keys to new backup '{}' (view {})",
                          self.store.len(), backup, self.view.number);
        let snapshot = self.store.snapshot();
        let view_num = self.view.number;

        let me = self.me.clone();
        let timeout = self.rpc_timeout();
        let tx_sync = self.tx_sync.clone();
        tokio::spawn(async move {
            let ok = match Self::transfer_store(
                &backup, snapshot, view_num, timeout,
            )
            .await
            {
                Ok(()) => true,
                Err(e) => {
                    pf_warn!(me; "store transfer to '{}' failed: {}",
                                 backup, e);
                    false
                }
            };
            if tx_sync.send(SyncOutcome { backup, ok }).is_err() {
                pf_debug!(me; "sync outcome receiver dropped early");
            }
        });
    }

    /// Sends the snapshot to the backup over a fresh connection.
    async fn transfer_store(
        backup: &str,
        snapshot: HashMap<String, String>,
        view_num: ViewNum,
        timeout: Duration,
    ) -> Result<(), ViewKvError> {
        let mut stub =
            PeerStub::connect(backup.to_string(), timeout).await?;
        let req = ApiRequest::SyncState {
            data: snapshot,
            view_num,
        };
        match stub.call(&req, timeout).await? {
            ApiReply::Ok => Ok(()),
            reply => Err(ViewKvError::msg(format!(
                "unexpected SyncState reply {:?}",
                reply
            ))),
        }
    }

    /// Reacts to a finished store transfer: drains the writes queued while
    /// it was in flight, in arrival order, through the normal forwarding
    /// path. Their clients were already acknowledged at queueing time.
    async fn handle_sync_outcome(&mut self, outcome: SyncOutcome) {
        self.syncing = false;
        if outcome.ok {
            pf_info!(self.me; "store transfer to '{}' complete",
                              outcome.backup);
            self.last_backup = Some(outcome.backup.clone());
        } else {
            // a later view still naming this backup re-triggers the transfer
            self.last_backup = None;
        }

        while let Some((key, value)) = self.pending_puts.pop_front() {
            if self.role != Role::Primary {
                pf_warn!(self.me; "dropping {} queued writes, no longer \
                                   primary", self.pending_puts.len() + 1);
                self.pending_puts.clear();
                break;
            }
            self.forward_then_apply(key, value).await;
        }

        // the view may have moved to yet another backup while this transfer
        // was in flight; it must not be left without a snapshot
        if self.role == Role::Primary {
            if let Some(backup) = self.view.backup.clone() {
                if backup != outcome.backup
                    && self.last_backup.as_deref() != Some(backup.as_str())
                {
                    self.begin_store_transfer(backup);
                }
            }
        }
    }
}

// KvReplica acceptor & servant task implementations
impl KvReplica {
    /// Connection acceptor task function. Exits when the daemon (the request
    /// channel receiver) is gone, releasing the listening socket.
    async fn acceptor_task(
        me: String,
        listener: TcpListener,
        tx_api: mpsc::UnboundedSender<(ApiRequest, oneshot::Sender<ApiReply>)>,
    ) {
        pf_debug!(me; "acceptor task spawned");

        loop {
            tokio::select! {
                () = tx_api.closed() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        pf_debug!(me; "accepted connection from '{}'", peer);
                        tokio::spawn(Self::servant_task(
                            me.clone(),
                            stream,
                            peer,
                            tx_api.clone(),
                        ));
                    }
                    Err(e) => {
                        pf_warn!(me; "error accepting connection: {}", e);
                    }
                },
            }
        }

        pf_debug!(me; "acceptor task exited");
    }

    /// Per-connection servant task function: strictly alternating
    /// request/reply service of one client or peer.
    async fn servant_task(
        me: String,
        mut stream: TcpStream,
        peer: SocketAddr,
        tx_api: mpsc::UnboundedSender<(ApiRequest, oneshot::Sender<ApiReply>)>,
    ) {
        loop {
            let req = match recv_msg::<ApiRequest, _>(&mut stream).await {
                Ok(req) => req,
                Err(_) => {
                    pf_debug!(me; "connection from '{}' closed", peer);
                    break;
                }
            };

            let (tx_reply, rx_reply) = oneshot::channel();
            if tx_api.send((req, tx_reply)).is_err() {
                break; // daemon event loop has exited
            }
            let reply = match rx_reply.await {
                Ok(reply) => reply,
                Err(_) => break,
            };

            if let Err(e) = send_msg(&mut stream, &reply).await {
                pf_debug!(me; "error replying to '{}': {}", peer, e);
                break;
            }
        }
    }
}
