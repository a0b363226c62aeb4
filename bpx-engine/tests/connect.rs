//! Full connect-path test: two engine instances pair their sockets over
//! loopback, negotiate features, authenticate and bring replication up.

#![allow(clippy::unwrap_used)]

use bpx_engine::testing::{MemBitmap, MemBlockIo, NullActivityLog};
use bpx_engine::{
    run_connection, Connection, ConnState, Device, ListenerRegistry, NetConfig, PeerDevice,
    ReplState, Resource, ResourceOptions,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct Node {
    conn: Arc<Connection>,
    pd: Arc<PeerDevice>,
}

async fn free_addr() -> SocketAddr {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = l.local_addr().unwrap();
    drop(l);
    addr
}

fn make_node(node_id: u32, peer_node_id: u32, current_uuid: u64) -> Node {
    let resource = Resource::new(ResourceOptions {
        name: format!("r{node_id}"),
        node_id,
        twopc_timeout: Duration::from_secs(5),
    });
    let device = Device::new(
        0,
        vec![peer_node_id],
        Arc::new(MemBlockIo::new(1 << 16)),
        Arc::new(MemBitmap::new(1, 512)),
        Arc::new(NullActivityLog::default()),
        64,
    );
    device.uuids.lock().unwrap().current = current_uuid;
    resource.add_device(device.clone());

    let net = NetConfig {
        peer_node_id,
        shared_secret: Some("wh4t-3ver".to_string()),
        ping_interval: Duration::from_millis(500),
        ping_timeout: Duration::from_millis(2000),
        connect_interval: Duration::from_millis(200),
        socket_timeout: Duration::from_millis(500),
        ..NetConfig::default()
    };
    let conn = Connection::new(resource, net);
    let pd = PeerDevice::new(device, peer_node_id, 0);
    conn.add_peer_device(pd.clone());
    Node { conn, pd }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_connect_and_establish() {
    let addr_a = free_addr().await;
    let addr_b = free_addr().await;

    let a = make_node(0, 1, 0xAAAA_0000_0000_0000);
    let b = make_node(1, 0, 0xAAAA_0000_0000_0000);

    let reg_a = ListenerRegistry::new();
    let reg_b = ListenerRegistry::new();

    let task_a = tokio::spawn(run_connection(a.conn.clone(), reg_a, addr_a, addr_b));
    let task_b = tokio::spawn(run_connection(b.conn.clone(), reg_b, addr_b, addr_a));

    let both_up = async {
        loop {
            if a.conn.cstate() == ConnState::Connected
                && b.conn.cstate() == ConnState::Connected
                && a.pd.repl_state() == ReplState::Established
                && b.pd.repl_state() == ReplState::Established
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), both_up)
        .await
        .expect("nodes did not establish replication");

    // Exactly one side owns conflict resolution.
    let ra = a.conn.flag(bpx_engine::CONN_RESOLVE_CONFLICTS);
    let rb = b.conn.flag(bpx_engine::CONN_RESOLVE_CONFLICTS);
    assert_ne!(ra, rb);

    // Both sides agreed on the newest dialect.
    assert_eq!(a.conn.version(), bpx_wire::PROTOCOL_MAX);
    assert_eq!(b.conn.version(), bpx_wire::PROTOCOL_MAX);

    task_a.abort();
    task_b.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_secret_goes_standalone() {
    let addr_a = free_addr().await;
    let addr_b = free_addr().await;

    let a = make_node(0, 1, 0xAAAA);
    let b = make_node(1, 0, 0xAAAA);
    {
        let mut net = (*b.conn.net()).clone();
        net.shared_secret = Some("different".to_string());
        b.conn.set_net(net);
    }

    let reg_a = ListenerRegistry::new();
    let reg_b = ListenerRegistry::new();

    let task_a = tokio::spawn(run_connection(a.conn.clone(), reg_a, addr_a, addr_b));
    let task_b = tokio::spawn(run_connection(b.conn.clone(), reg_b, addr_b, addr_a));

    // At least one side must detect the mismatch and go standalone.
    let gave_up = async {
        loop {
            if a.conn.cstate() == ConnState::StandAlone || b.conn.cstate() == ConnState::StandAlone
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), gave_up)
        .await
        .expect("auth mismatch was not detected");
    assert_ne!(a.pd.repl_state(), ReplState::Established);
    assert_ne!(b.pd.repl_state(), ReplState::Established);

    task_a.abort();
    task_b.abort();
}
