#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

mod ack;
mod auth;
mod bitmap_recv;
mod block;
mod config;
mod conflict;
mod connection;
mod epoch;
mod handshake;
mod listener;
mod peer_device;
mod pool;
mod receiver;
mod request;
mod resource;
mod resync;
mod sender;
mod state;
pub mod testing;
mod twopc;
mod uuids;
mod worker;

pub use block::{
    ActivityLog, BlockIo, HelperEvent, IoCallback, IoDone, IoKind, IoRequest, NoHelper,
    PolicyHelper, SyncBitmap, SUBMIT_DISCARD, SUBMIT_FLUSH, SUBMIT_FUA, SUBMIT_SYNC,
};
pub use config::{AfterSbPolicy, IntegrityAlg, NetConfig, ResourceOptions, WireProtocol};
pub use conflict::{handle_write_conflicts, ConflictOutcome};
pub use connection::{
    run_connection, send_initial_state, Connection, CONN_DISCONNECT_EXPECTED, CONN_DRY_RUN,
    CONN_PING_PENDING, CONN_RESOLVE_CONFLICTS,
};
pub use epoch::{
    bump_write_ordering, AttachOutcome, Epoch, EpochEvent, EpochList, EpochOutcome, WriteOrdering,
};
pub use handshake::sync_handshake;
pub use listener::{establish_pair, ListenerRegistry, SocketPair, Waiter};
pub use peer_device::{PeerDevice, RsPending, PD_INITIAL_STATE_RECEIVED};
pub use pool::{PagePool, PAGE_SIZE};
pub use ack::run_ack_reader;
pub use auth::authenticate;
pub use receiver::{exchange_features, run_receiver, send_protocol};
pub use request::{
    EeQueue, PeerRequest, RequestId, RequestStore, EE_IN_INTERVAL_TREE, EE_IS_BARRIER,
    EE_MAY_SET_IN_SYNC, EE_RESTART_REQUESTS, EE_RS_WRITE, EE_SEND_WRITE_ACK, EE_TRIM,
};
pub use resource::{Device, LocalRequest, Resource};
pub use resync::{start_resync, BM_BLOCK_SIZE, BM_SECT_PER_BIT};
pub use state::{ConnState, DiskState, ReplState, Role};
pub use twopc::{begin_reply_aggregation, receive_twopc, AggState, TwopcReply, TwopcState};
pub use uuids::{uuid_compare, CompareCtx, CompareResult, PeerUuidView, UuidSet, UUID_NEW_BM_OFFSET};
pub use worker::{spawn as spawn_worker, WorkItem};
