//! Replica-side link to the view authority: the periodic heartbeat task.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::authority::{CtrlReply, CtrlRequest, View, ViewNum};
use crate::utils::{recv_msg, send_msg, ViewKvError};

/// Heartbeat task function. Every ping interval, sends a ping advertising
/// the replica's latest installed view number and relays the returned view
/// into the replica's event loop. Keeps dialing the authority until it is
/// reachable, so a replica may start before the authority does. Exits when
/// the replica (the view channel receiver) is gone.
pub(crate) async fn heartbeat_task(
    me: String,
    authority: SocketAddr,
    ping_interval: Duration,
    rpc_timeout: Duration,
    rx_view_num: watch::Receiver<ViewNum>,
    tx_view: mpsc::UnboundedSender<View>,
) {
    pf_debug!(me; "heartbeat task spawned");

    let mut interval = time::interval(ping_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut conn: Option<TcpStream> = None;

    loop {
        tokio::select! {
            () = tx_view.closed() => break,

            _ = interval.tick() => {
                if conn.is_none() {
                    match time::timeout(
                        rpc_timeout,
                        TcpStream::connect(authority),
                    )
                    .await
                    {
                        Ok(Ok(stream)) => {
                            pf_info!(me; "connected to view authority '{}'",
                                         authority);
                            conn = Some(stream);
                        }
                        _ => {
                            pf_debug!(me; "view authority '{}' unreachable, \
                                           will retry", authority);
                            continue;
                        }
                    }
                }

                let view_num = *rx_view_num.borrow();
                if let Some(ref mut stream) = conn {
                    match ping(stream, &me, view_num, rpc_timeout).await {
                        Ok(view) => {
                            if tx_view.send(view).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            pf_warn!(me; "ping failed: {}", e);
                            conn = None;
                        }
                    }
                }
            },
        }
    }

    pf_debug!(me; "heartbeat task exited");
}

/// Issues one ping over the established authority connection.
async fn ping(
    conn: &mut TcpStream,
    me: &str,
    view_num: ViewNum,
    rpc_timeout: Duration,
) -> Result<View, ViewKvError> {
    let req = CtrlRequest::Ping {
        server: me.to_string(),
        view_num,
    };
    let reply: CtrlReply = time::timeout(rpc_timeout, async {
        send_msg(conn, &req).await?;
        recv_msg(conn).await
    })
    .await??;
    Ok(reply.view)
}
