//! Thin routing client: resolves the primary through the view authority and
//! retries operations across view changes.

use std::net::SocketAddr;

use rand::Rng;
use serde::Deserialize;
use tokio::time::{self, Duration, Instant};

use crate::authority::View;
use crate::client::{ApiStub, CtrlStub};
use crate::server::{ApiReply, ApiRequest, StoreDump};
use crate::utils::ViewKvError;

/// How long to keep dialing the view authority at startup.
const CONNECT_RETRIES: u8 = 30;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base backoff between retries of a failed operation. Actual sleeps
    /// are jittered below this value.
    pub retry_interval_ms: u64,

    /// Timeout applied to every individual RPC issued by the client.
    pub rpc_timeout_ms: u64,

    /// Overall per-operation deadline after which a retried operation gives
    /// up with an error. 0 means retry forever.
    pub op_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            retry_interval_ms: 500,
            rpc_timeout_ms: 5000,
            op_timeout_ms: 0,
        }
    }
}

/// Client handle to the replicated key-value service.
///
/// Operations retry through view changes until they succeed (or until the
/// configured per-operation deadline passes), so a `put` may be applied more
/// than once under failover; writes are last-writer-wins per key, which
/// makes duplicate application indistinguishable from single application.
pub struct KvClient {
    /// Configuration parameters struct.
    config: ClientConfig,

    /// Connection stub to the view authority.
    ctrl_stub: CtrlStub,

    /// Cached primary: its name and an established connection. Cleared on
    /// any error or `NotPrimary` reply, re-resolved from the authority.
    primary: Option<(String, ApiStub)>,
}

impl KvClient {
    /// Creates a new client handle connected to the view authority.
    pub async fn new_and_setup(
        authority: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, ViewKvError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    retry_interval_ms, rpc_timeout_ms,
                                    op_timeout_ms)?;
        if config.retry_interval_ms == 0 {
            return logged_err!(
                "c";
                "invalid config.retry_interval_ms '{}'",
                config.retry_interval_ms
            );
        }
        if config.rpc_timeout_ms == 0 {
            return logged_err!(
                "c";
                "invalid config.rpc_timeout_ms '{}'",
                config.rpc_timeout_ms
            );
        }

        let ctrl_stub =
            CtrlStub::new_by_connect(authority, CONNECT_RETRIES).await?;
        Ok(KvClient {
            config,
            ctrl_stub,
            primary: None,
        })
    }

    /// Reads the value of a key. Returns `Ok(None)` if the key was never
    /// written.
    pub async fn get(
        &mut self,
        key: &str,
    ) -> Result<Option<String>, ViewKvError> {
        let req = ApiRequest::Get {
            key: key.to_string(),
        };
        match self.retry_op(req).await? {
            ApiReply::Value { value } => Ok(Some(value)),
            ApiReply::NoKey => Ok(None),
            reply => {
                logged_err!("c"; "unexpected Get reply {:?}", reply)
            }
        }
    }

    /// Writes the value of a key.
    pub async fn put(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<(), ViewKvError> {
        let req = ApiRequest::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.retry_op(req).await? {
            ApiReply::Ok => Ok(()),
            reply => {
                logged_err!("c"; "unexpected Put reply {:?}", reply)
            }
        }
    }

    /// Queries the view authority for the current view.
    pub async fn view(&mut self) -> Result<View, ViewKvError> {
        self.ctrl_stub
            .get_view(Duration::from_millis(self.config.rpc_timeout_ms))
            .await
    }

    /// Fetches the diagnostics dump of the current primary.
    pub async fn dump(&mut self) -> Result<StoreDump, ViewKvError> {
        match self.retry_op(ApiRequest::Dump).await? {
            ApiReply::Dump(dump) => Ok(dump),
            reply => {
                logged_err!("c"; "unexpected Dump reply {:?}", reply)
            }
        }
    }

    /// Fetches the diagnostics dump of one specific replica, bypassing
    /// primary resolution.
    pub async fn dump_of(
        &mut self,
        server: &str,
    ) -> Result<StoreDump, ViewKvError> {
        let timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let mut stub = ApiStub::new_by_connect(server, timeout).await?;
        match stub.call(&ApiRequest::Dump, timeout).await? {
            ApiReply::Dump(dump) => Ok(dump),
            reply => {
                logged_err!("c"; "unexpected Dump reply {:?}", reply)
            }
        }
    }

    /// Issues the request to the current primary, retrying through view
    /// changes: any transport error or `NotPrimary` reply clears the cached
    /// primary, sleeps a jittered backoff, and tries again.
    async fn retry_op(
        &mut self,
        req: ApiRequest,
    ) -> Result<ApiReply, ViewKvError> {
        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let deadline = if self.config.op_timeout_ms > 0 {
            Some(
                Instant::now()
                    + Duration::from_millis(self.config.op_timeout_ms),
            )
        } else {
            None
        };

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return logged_err!("c"; "operation timed out");
                }
            }

            if self.primary.is_none() {
                match self.resolve_primary(rpc_timeout).await {
                    Ok(()) => {}
                    Err(e) => {
                        pf_debug!("c"; "resolving primary failed: {}", e);
                        self.backoff_sleep().await;
                        continue;
                    }
                }
            }

            let call_result = match self.primary.as_mut() {
                Some((_, stub)) => stub.call(&req, rpc_timeout).await,
                None => {
                    // no primary in the current view; wait out the failover
                    self.backoff_sleep().await;
                    continue;
                }
            };

            match call_result {
                Ok(ApiReply::NotPrimary) => {
                    pf_debug!("c"; "server was not primary, retrying");
                    self.primary = None;
                    self.backoff_sleep().await;
                }
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    pf_debug!("c"; "request to primary failed: {}", e);
                    self.primary = None;
                    self.backoff_sleep().await;
                }
            }
        }
    }

    /// Asks the authority who the primary is and connects to it. Leaves the
    /// cache empty if the current view has no primary.
    async fn resolve_primary(
        &mut self,
        rpc_timeout: Duration,
    ) -> Result<(), ViewKvError> {
        let view = self.ctrl_stub.get_view(rpc_timeout).await?;
        if let Some(primary) = view.primary {
            let stub = ApiStub::new_by_connect(&primary, rpc_timeout).await?;
            self.primary = Some((primary, stub));
        }
        Ok(())
    }

    /// Sleeps a jittered backoff before the next retry.
    async fn backoff_sleep(&self) {
        let base = self.config.retry_interval_ms;
        let ms = rand::thread_rng().gen_range(base / 2..=base);
        time::sleep(Duration::from_millis(ms)).await;
    }
}
