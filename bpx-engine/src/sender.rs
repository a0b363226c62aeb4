//! Outbound packet emission.
//!
//! All sends go through `send_packet`, which frames the payload with the
//! negotiated header dialect and writes it to the requested socket half.
//! The receiver, ack-reader and worker share these helpers; the socket
//! halves are mutex-guarded so interleaved packets stay whole.

use crate::connection::Connection;
use bpx_core::{PlexError, Result};
use bpx_wire::{encode_header, BarrierAckPayload, BlockAckPayload, Command, TwopcReplyPayload};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Data,
    Meta,
}

pub async fn send_packet(
    conn: &Connection,
    sock: SocketKind,
    cmd: Command,
    volume: i16,
    payload: &[u8],
) -> Result<()> {
    let header = encode_header(cmd, payload.len() as u32, volume, conn.version());
    let half = match sock {
        SocketKind::Data => &conn.data_tx,
        SocketKind::Meta => &conn.meta_tx,
    };
    let mut guard = half.lock().await;
    let Some(tx) = guard.as_mut() else {
        return Err(PlexError::NetworkFatal(format!(
            "{cmd}: socket already closed"
        )));
    };
    tx.write_all(&header).await?;
    if !payload.is_empty() {
        tx.write_all(payload).await?;
    }
    tx.flush().await?;
    Ok(())
}

/// Block-ack family member on the meta socket.
pub async fn send_block_ack(
    conn: &Connection,
    cmd: Command,
    volume: i16,
    sector: u64,
    block_id: u64,
    blksize: u32,
    seq_num: u32,
) -> Result<()> {
    let payload = BlockAckPayload {
        sector,
        block_id,
        blksize,
        seq_num,
    }
    .encode();
    send_packet(conn, SocketKind::Meta, cmd, volume, &payload).await
}

pub async fn send_barrier_ack(conn: &Connection, barrier_nr: u32, set_size: u32) -> Result<()> {
    let payload = BarrierAckPayload {
        barrier_nr,
        set_size,
    }
    .encode();
    send_packet(conn, SocketKind::Meta, Command::BarrierAck, -1, &payload).await
}

pub async fn send_twopc_reply(
    conn: &Connection,
    cmd: Command,
    reply: &TwopcReplyPayload,
) -> Result<()> {
    send_packet(conn, SocketKind::Meta, cmd, -1, &reply.encode()).await
}
