//! HMAC challenge-response authentication.
//!
//! Both sides send a random challenge, answer the peer's challenge with
//! HMAC(shared-secret, challenge) and verify the peer's answer. From
//! protocol 110 on, the responder appends the big-endian node id of the
//! side being answered, so a response can not be reflected back to its
//! author across a multi-connection fleet.

use crate::connection::Connection;
use crate::receiver::{recv_exact, recv_header};
use crate::sender::{self, SocketKind};
use bpx_core::{PlexError, Result, CHALLENGE_LEN};
use bpx_wire::Command;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::AsyncRead;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

fn response_for(secret: &str, challenge: &[u8], node_id: Option<u32>) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PlexError::AuthFailed(format!("bad shared secret: {e}")))?;
    mac.update(challenge);
    if let Some(id) = node_id {
        mac.update(&id.to_be_bytes());
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Run the mutual challenge-response on the data socket. A failure takes
/// the connection standalone.
pub async fn authenticate<R: AsyncRead + Unpin>(conn: &Connection, rx: &mut R) -> Result<()> {
    let net = conn.net();
    let Some(secret) = net.shared_secret.clone() else {
        return Ok(());
    };
    let suffix_ids = conn.version() >= 110;

    let mut my_challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut my_challenge);

    sender::send_packet(
        conn,
        SocketKind::Data,
        Command::AuthChallenge,
        -1,
        &my_challenge,
    )
    .await?;

    let pi = recv_header(conn, rx).await?;
    if pi.cmd != Command::AuthChallenge {
        return Err(PlexError::NetworkFatal(format!(
            "expected AuthChallenge, received {}",
            pi.cmd
        )));
    }
    if (pi.size as usize) < CHALLENGE_LEN || (pi.size as usize) > CHALLENGE_LEN * 2 {
        return Err(PlexError::AuthFailed(format!(
            "challenge of unexpected size {}",
            pi.size
        )));
    }
    let peers_challenge = recv_exact(rx, pi.size as usize).await?;

    if peers_challenge[..CHALLENGE_LEN] == my_challenge {
        return Err(PlexError::AuthFailed(
            "peer presented the same challenge".into(),
        ));
    }

    let response = response_for(
        &secret,
        &peers_challenge,
        suffix_ids.then_some(conn.resource.opts.node_id),
    )?;
    sender::send_packet(conn, SocketKind::Data, Command::AuthResponse, -1, &response).await?;

    let pi = recv_header(conn, rx).await?;
    if pi.cmd != Command::AuthResponse {
        return Err(PlexError::NetworkFatal(format!(
            "expected AuthResponse, received {}",
            pi.cmd
        )));
    }
    if pi.size as usize != response.len() {
        return Err(PlexError::NetworkFatal(format!(
            "auth response of unexpected size {}",
            pi.size
        )));
    }
    let peers_response = recv_exact(rx, pi.size as usize).await?;

    let right_response = response_for(
        &secret,
        &my_challenge,
        suffix_ids.then_some(net.peer_node_id),
    )?;
    if peers_response != right_response {
        return Err(PlexError::AuthFailed("response digest mismatch".into()));
    }

    info!(
        target: "bpx::conn",
        bytes = right_response.len(),
        "peer authenticated using HMAC"
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_response_is_deterministic() {
        let a = response_for("secret", b"challenge", None).unwrap();
        let b = response_for("secret", b"challenge", None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_response_depends_on_secret_and_node() {
        let base = response_for("secret", b"challenge", None).unwrap();
        assert_ne!(base, response_for("other", b"challenge", None).unwrap());
        assert_ne!(base, response_for("secret", b"challenge", Some(1)).unwrap());
        // Different node suffixes defeat reflection between connections.
        assert_ne!(
            response_for("secret", b"challenge", Some(1)).unwrap(),
            response_for("secret", b"challenge", Some(2)).unwrap()
        );
    }
}
