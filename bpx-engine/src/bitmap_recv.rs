//! Bitmap transfer.
//!
//! Around a resync both sides exchange their out-of-sync bitmaps on the
//! data socket, either as plain little-endian word segments or
//! RLE-compressed. The receive loop keeps pulling bitmap frames until the
//! bit count is complete; the WFBitmapT side then echoes its own bitmap
//! and the resync starts.

use crate::block::SyncBitmap;
use crate::connection::Connection;
use crate::peer_device::PeerDevice;
use crate::receiver::{recv_exact, recv_header};
use crate::sender::{self, SocketKind};
use crate::state::ReplState;
use crate::worker::WorkItem;
use bpx_core::{PlexError, Result};
use bpx_wire::{rle_decode, rle_encode, words_from_le_bytes, words_to_le_bytes, Command, PacketInfo};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info};

/// Largest plain segment we emit, in 64-bit words.
const PLAIN_WORDS_PER_PACKET: usize = 512;

#[derive(Default)]
struct XferCtx {
    bit_offset: u64,
    word_offset: u64,
}

pub async fn receive_bitmap<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    first: PacketInfo,
) -> Result<()> {
    let pd = conn
        .peer_device(first.volume)
        .ok_or_else(|| PlexError::Protocol(format!("bitmap for unknown volume {}", first.volume)))?;
    let device = &pd.device;
    let bitmap = &device.bitmap;
    let total_bits = bitmap.total_bits();
    let total_words = (total_bits as usize).div_ceil(64) as u64;

    let mut c = XferCtx::default();
    let mut pi = first;
    loop {
        match pi.cmd {
            Command::Bitmap => {
                let payload = recv_exact(rx, pi.size as usize).await?;
                if payload.len() % 8 != 0 {
                    return Err(PlexError::MalformedFrame(format!(
                        "plain bitmap segment of {} bytes",
                        payload.len()
                    )));
                }
                let words = words_from_le_bytes(&payload);
                if c.word_offset + words.len() as u64 > total_words {
                    return Err(PlexError::Protocol("bitmap overflow in plain segment".into()));
                }
                bitmap.merge_words(pd.bitmap_slot, c.word_offset, &words);
                c.word_offset += words.len() as u64;
                c.bit_offset = (c.word_offset * 64).min(total_bits);
            }
            Command::CompressedBitmap => {
                if conn.version() < 90 {
                    return Err(PlexError::ProtocolIncompatible(
                        "compressed bitmap needs protocol 90".into(),
                    ));
                }
                let payload = recv_exact(rx, pi.size as usize).await?;
                let (runs, new_offset) = rle_decode(&payload, c.bit_offset, total_bits)?;
                for (s, e) in runs {
                    bitmap.set_bits(pd.bitmap_slot, s, e);
                }
                c.bit_offset = new_offset;
                c.word_offset = c.bit_offset / 64;
            }
            other => {
                return Err(PlexError::Protocol(format!(
                    "{other} in the middle of a bitmap transfer"
                )))
            }
        }

        if c.bit_offset >= total_bits {
            break;
        }
        pi = recv_header(conn, rx).await?;
        conn.tick_received();
    }

    info!(
        target: "bpx::recv",
        volume = pd.volume,
        bits = bitmap.total_weight(pd.bitmap_slot),
        "bitmap received"
    );

    match pd.repl_state() {
        ReplState::WFBitmapT => {
            send_bitmap(conn, &pd).await?;
            if conn.version() < 110 {
                // The source announces the sync uuid before we may start.
                pd.set_repl_state(ReplState::WFSyncUuid);
            } else {
                conn.queue_work(WorkItem::StartResync {
                    volume: pd.volume,
                    side: ReplState::SyncTarget,
                })?;
            }
        }
        ReplState::WFBitmapS => {
            conn.queue_work(WorkItem::StartResync {
                volume: pd.volume,
                side: ReplState::SyncSource,
            })?;
        }
        other => {
            info!(
                target: "bpx::recv",
                volume = pd.volume,
                state = %other,
                "unexpected replication state in bitmap receive"
            );
        }
    }
    Ok(())
}

/// Ship our bitmap slot to the peer, compressed when it pays off.
pub async fn send_bitmap(conn: &Connection, pd: &PeerDevice) -> Result<()> {
    let bitmap = &pd.device.bitmap;
    let words = bitmap.snapshot_words(pd.bitmap_slot);
    let total_bits = bitmap.total_bits();
    let volume = pd.volume as i16;

    if conn.version() >= 90 {
        if let Some(payload) = rle_encode(&words, total_bits)? {
            debug!(
                target: "bpx::recv",
                volume = pd.volume,
                bytes = payload.len(),
                "sending compressed bitmap"
            );
            return sender::send_packet(
                conn,
                SocketKind::Data,
                Command::CompressedBitmap,
                volume,
                &payload,
            )
            .await;
        }
    }

    for chunk in words.chunks(PLAIN_WORDS_PER_PACKET) {
        let payload = words_to_le_bytes(chunk);
        sender::send_packet(conn, SocketKind::Data, Command::Bitmap, volume, &payload).await?;
    }
    Ok(())
}
