//! Two-phase commit receiver for cluster-wide state changes.
//!
//! A resource admits one remote state change at a time. Prepare evaluates
//! the change locally and answers Yes/No/Retry; duplicates of the same
//! (initiator, tid) are re-acked, concurrent transactions get Retry.
//! Commit and Abort settle the prepared transaction, cancel its timer and
//! queue the request for propagation to the initiator's other peers. An
//! expired prepare aborts the transaction on its own.

use crate::connection::Connection;
use crate::sender;
use crate::state::{ConnState, Role};
use bpx_core::Result;
use bpx_wire::{Command, TwopcPayload, TwopcReplyPayload};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

// State-change mask/val layout, shared with the wire state report:
// role(0-1) peer_disk(2-5) disk(6-9) repl(10-14) conn(15-17).
pub const MASK_ROLE: u32 = 0x3;
pub const MASK_CONN: u32 = 0x7 << 15;

#[must_use]
pub fn val_role(v: u32) -> u32 {
    v & 0x3
}

#[must_use]
pub fn val_conn(v: u32) -> u32 {
    (v >> 15) & 0x7
}

pub const CONN_VAL_CONNECTED: u32 = 1;
pub const CONN_VAL_DISCONNECTING: u32 = 2;

/// Aggregation of a transaction's replies, as seen by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggState {
    #[default]
    Idle,
    WaitingReplies,
    AllReplied,
    Timeout,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwopcReply {
    pub tid: u32,
    pub initiator_node_id: u32,
    pub target_node_id: i32,
    pub reachable_nodes: u64,
    pub primary_nodes: u64,
    pub weak_nodes: u64,
    pub is_disconnect: bool,
}

/// An outbound propagation step: (peer node id, command, request).
pub type Propagation = (u32, Command, TwopcPayload);

#[derive(Default)]
pub struct TwopcState {
    /// A remote transaction is prepared and not yet settled.
    pub remote_state_change: bool,
    pub reply: Option<TwopcReply>,
    /// Peer node the prepare arrived from.
    pub parent_peer: Option<u32>,
    /// Generation guard for the prepare timer.
    pub generation: u64,
    pub deadline: Option<Instant>,
    /// Initiator-side reply aggregation.
    pub aggregation: AggState,
    pub pending_replies: u32,
    /// Nested propagation queue, drained by the connection sender.
    pub outbound: Vec<Propagation>,
}

enum Verdict {
    Yes,
    No,
    Retry,
}

/// Evaluate a state change against local constraints.
fn evaluate(conn: &Connection, mask: u32, val: u32) -> Verdict {
    if mask & MASK_ROLE != 0 && val_role(val) == Role::Primary as u32 {
        let net = conn.net();
        if !net.two_primaries && conn.resource.role() == Role::Primary {
            return Verdict::No;
        }
    }
    Verdict::Yes
}

fn apply(conn: &Connection, mask: u32, val: u32) {
    if mask & MASK_ROLE != 0 {
        if let Some(role) = Role::from_wire(val_role(val)) {
            // A role change for the initiator updates our view of the
            // peer's role on every peer device.
            for pd in conn.peer_device_list() {
                *pd.peer_role.lock().unwrap_or_else(|e| e.into_inner()) = role;
            }
        }
    }
    if mask & MASK_CONN != 0 && val_conn(val) == CONN_VAL_DISCONNECTING {
        conn.set_flag(crate::connection::CONN_DISCONNECT_EXPECTED);
    }
}

pub async fn receive_twopc(
    conn: &Arc<Connection>,
    cmd: Command,
    p: &TwopcPayload,
) -> Result<()> {
    let resource = &conn.resource;
    let self_mask = resource.node_mask_self();
    let peer_mask = 1u64 << conn.net().peer_node_id;

    let mut reply = TwopcReply {
        tid: p.tid,
        initiator_node_id: p.initiator_node_id,
        target_node_id: p.target_node_id,
        reachable_nodes: self_mask
            | if conn.cstate() == ConnState::Connected {
                peer_mask
            } else {
                0
            },
        primary_nodes: p.primary_nodes,
        weak_nodes: p.weak_nodes,
        is_disconnect: false,
    };

    // Concurrency and duplicate screening. The verdict is computed while
    // holding the lock, but the guard is always dropped before we reach
    // any `.await` below (a `MutexGuard` is never `Send`).
    enum Screening {
        RejectForeignPrepare,
        RejectForeignOther,
        DuplicatePrepare,
        IgnoreSettled,
        Continue(bool),
    }

    let screening = {
        let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
        if twopc.remote_state_change {
            let same = twopc
                .reply
                .map_or(false, |r| {
                    r.initiator_node_id == p.initiator_node_id && r.tid == p.tid
                });
            if !same {
                if cmd == Command::TwopcPrepare {
                    Screening::RejectForeignPrepare
                } else {
                    Screening::RejectForeignOther
                }
            } else if cmd == Command::TwopcPrepare {
                // Duplicate prepare: we already said yes.
                Screening::DuplicatePrepare
            } else {
                Screening::Continue(true)
            }
        } else if cmd != Command::TwopcPrepare {
            // Already committed or aborted; duplicate settle packet.
            Screening::IgnoreSettled
        } else {
            twopc.remote_state_change = true;
            Screening::Continue(false)
        }
    };

    let prepared = match screening {
        Screening::RejectForeignPrepare => {
            info!(
                target: "bpx::twopc",
                tid = p.tid,
                "rejecting concurrent remote state change"
            );
            return send_reply(conn, Command::TwopcRetry, &reply).await;
        }
        Screening::RejectForeignOther => {
            debug!(target: "bpx::twopc", tid = p.tid, cmd = %cmd, "ignoring packet for foreign transaction");
            return Ok(());
        }
        Screening::DuplicatePrepare => {
            return send_reply(conn, Command::TwopcYes, &reply).await;
        }
        Screening::IgnoreSettled => {
            debug!(target: "bpx::twopc", tid = p.tid, cmd = %cmd, "ignoring settled transaction packet");
            return Ok(());
        }
        Screening::Continue(prepared) => prepared,
    };

    if p.mask & MASK_CONN != 0 {
        let initiator_mask = 1u64 << p.initiator_node_id;
        match val_conn(p.val) {
            CONN_VAL_CONNECTED => reply.reachable_nodes |= initiator_mask,
            CONN_VAL_DISCONNECTING => {
                reply.reachable_nodes &= !initiator_mask;
                reply.is_disconnect = true;
            }
            _ => {}
        }
    }

    if cmd == Command::TwopcPrepare {
        let becomes_primary = p.mask & MASK_ROLE != 0 && val_role(p.val) == Role::Primary as u32;
        if becomes_primary || (p.mask & MASK_ROLE == 0 && resource.role() == Role::Primary) {
            reply.primary_nodes |= self_mask;
            reply.weak_nodes |= !(self_mask | reply.reachable_nodes);
        }
    }

    {
        let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
        twopc.reply = Some(reply);
    }

    match cmd {
        Command::TwopcPrepare => {
            info!(target: "bpx::twopc", tid = p.tid, initiator = p.initiator_node_id, "preparing remote state change");
            match evaluate(conn, p.mask, p.val) {
                Verdict::Yes => {
                    arm_prepare_timer(conn, p.tid);
                    queue_propagation(resource, conn, cmd, p);
                    send_reply(conn, Command::TwopcYes, &reply).await
                }
                Verdict::No => {
                    clear_transaction(resource);
                    send_reply(conn, Command::TwopcNo, &reply).await
                }
                Verdict::Retry => {
                    clear_transaction(resource);
                    send_reply(conn, Command::TwopcRetry, &reply).await
                }
            }
        }
        Command::TwopcAbort => {
            info!(target: "bpx::twopc", tid = p.tid, "aborting remote state change");
            if prepared {
                clear_transaction(resource);
            }
            queue_propagation(resource, conn, cmd, p);
            Ok(())
        }
        _ => {
            info!(
                target: "bpx::twopc",
                tid = p.tid,
                primary_nodes = reply.primary_nodes,
                weak_nodes = reply.weak_nodes,
                "committing remote state change"
            );
            apply(conn, p.mask, p.val);
            if prepared {
                clear_transaction(resource);
            }
            queue_propagation(resource, conn, cmd, p);
            Ok(())
        }
    }
}

fn clear_transaction(resource: &crate::resource::Resource) {
    let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
    twopc.remote_state_change = false;
    twopc.parent_peer = None;
    twopc.deadline = None;
    twopc.generation += 1;
    resource.twopc_notify.notify_waiters();
}

/// Forward the request to the initiator's other directly connected peers.
/// With a single connection per resource the queue drains empty; it exists
/// so a fan-out topology replays the transaction outward instead of
/// calling into other connections synchronously.
fn queue_propagation(
    resource: &crate::resource::Resource,
    conn: &Connection,
    cmd: Command,
    p: &TwopcPayload,
) {
    let from = conn.net().peer_node_id;
    let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
    twopc.outbound.push((from, cmd, *p));
}

fn arm_prepare_timer(conn: &Arc<Connection>, tid: u32) {
    let resource = conn.resource.clone();
    let timeout = resource.opts.twopc_timeout;
    let generation = {
        let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
        twopc.parent_peer = Some(conn.net().peer_node_id);
        twopc.deadline = Some(Instant::now() + timeout);
        twopc.generation += 1;
        twopc.generation
    };
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
        if twopc.generation == generation && twopc.remote_state_change {
            warn!(target: "bpx::twopc", tid, "prepared state change timed out, aborting");
            twopc.remote_state_change = false;
            twopc.parent_peer = None;
            twopc.deadline = None;
            twopc.aggregation = AggState::Timeout;
            drop(twopc);
            resource.twopc_notify.notify_waiters();
        }
    });
}

/// Initiator side: open a transaction of our own and start collecting
/// replies from `expected` participants.
pub fn begin_reply_aggregation(resource: &crate::resource::Resource, tid: u32, expected: u32) {
    let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
    twopc.reply = Some(TwopcReply {
        tid,
        initiator_node_id: resource.opts.node_id,
        target_node_id: -1,
        reachable_nodes: resource.node_mask_self(),
        primary_nodes: 0,
        weak_nodes: 0,
        is_disconnect: false,
    });
    twopc.pending_replies = expected;
    twopc.aggregation = AggState::WaitingReplies;
}

/// Initiator side: account one reply from a participant.
pub fn handle_reply(conn: &Connection, cmd: Command, payload: &TwopcReplyPayload) {
    let resource = &conn.resource;
    let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
    if twopc.aggregation != AggState::WaitingReplies {
        debug!(target: "bpx::twopc", tid = payload.tid, "unsolicited twopc reply");
        return;
    }
    if let Some(reply) = &mut twopc.reply {
        if reply.tid != payload.tid {
            return;
        }
        match cmd {
            Command::TwopcYes => {
                reply.reachable_nodes |= payload.reachable_nodes;
                reply.primary_nodes |= payload.primary_nodes;
                reply.weak_nodes |= payload.weak_nodes;
            }
            Command::TwopcNo | Command::TwopcRetry => {
                twopc.aggregation = AggState::Aborted;
            }
            _ => return,
        }
    }
    twopc.pending_replies = twopc.pending_replies.saturating_sub(1);
    if twopc.pending_replies == 0 && twopc.aggregation == AggState::WaitingReplies {
        twopc.aggregation = AggState::AllReplied;
    }
    drop(twopc);
    resource.twopc_notify.notify_waiters();
}

/// Teardown hook: a prepared transaction whose parent connection died is
/// rolled back so the resource does not stay locked.
pub fn abort_if_parent(conn: &Connection) {
    let resource = &conn.resource;
    let peer = conn.net().peer_node_id;
    let mut twopc = resource.twopc.lock().unwrap_or_else(|e| e.into_inner());
    if twopc.remote_state_change && twopc.parent_peer == Some(peer) {
        info!(target: "bpx::twopc", peer, "rolling back prepared state change from lost peer");
        twopc.remote_state_change = false;
        twopc.parent_peer = None;
        twopc.deadline = None;
        twopc.generation += 1;
        twopc.aggregation = AggState::Aborted;
        drop(twopc);
        resource.twopc_notify.notify_waiters();
    }
}

async fn send_reply(conn: &Connection, cmd: Command, reply: &TwopcReply) -> Result<()> {
    let payload = TwopcReplyPayload {
        tid: reply.tid,
        initiator_node_id: reply.initiator_node_id,
        reachable_nodes: reply.reachable_nodes,
        primary_nodes: reply.primary_nodes,
        weak_nodes: reply.weak_nodes,
    };
    sender::send_twopc_reply(conn, cmd, &payload).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_val_layout() {
        let val = (Role::Primary as u32) | (CONN_VAL_DISCONNECTING << 15);
        assert_eq!(val_role(val), Role::Primary as u32);
        assert_eq!(val_conn(val), CONN_VAL_DISCONNECTING);
    }

    #[test]
    fn test_agg_state_default() {
        assert_eq!(AggState::default(), AggState::Idle);
    }
}
