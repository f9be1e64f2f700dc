//! The four-message TOFU handshake (spec.md §4.H).
//!
//! Server-driven: identity → client challenge → server ephemeral +
//! signature → both sides derive the session key. A mismatch at any
//! step aborts the connection before it reaches `TRUSTED`; the trust
//! store is only ever written in the TOFU step, before the signature is
//! checked, matching standard TOFU semantics.

use crate::aead::SessionCipher;
use crate::buffer_pool::BufferPool;
use crate::error::{Error, IdentityError, ProtocolError};
use crate::framing::{read_frame, write_frame, Frame};
use crate::identity::{verify_signature, ServerIdentity};
use crate::kex::{decode_public_point, EphemeralKeyPair};
use crate::packet::{Packet, SystemPacketType};
use crate::trust::{fingerprint, TrustStore};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClientHandshake {
    challenge: [u8; 32],
    client_ephemeral_public: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerHandshake {
    server_ephemeral_public: Vec<u8>,
    signature: Vec<u8>,
}

pub struct ServerHandshakeOutcome {
    pub cipher: SessionCipher,
}

pub struct ClientHandshakeOutcome {
    pub cipher: SessionCipher,
    pub server_public_key: Vec<u8>,
}

async fn send_handshake_packet<W>(writer: &mut W, payload: Vec<u8>) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let packet = Packet::plaintext(SystemPacketType::Handshake.identifier(), payload);
    write_frame(writer, packet.encode()?).await?;
    Ok(())
}

/// Read one frame and decode it as a handshake packet, rejecting
/// keep-alives, disconnects, and anything but `Handshake` (spec.md §4.H
/// step 2: any other packet during the handshake is a protocol error,
/// and a `Disconnect` specifically gets its own variant since it is a
/// plausible-looking but still invalid thing for a peer to send here).
async fn recv_handshake_payload<R>(
    reader: &mut R,
    max_packet_size: u32,
    pool: &Arc<BufferPool>,
) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader, max_packet_size, pool).await?;
    let bytes = match frame {
        Frame::Payload(buf) => buf.as_slice().to_vec(),
        Frame::KeepAlive => {
            return Err(ProtocolError::EmptyMandatoryField("handshake payload").into())
        }
    };
    let packet = Packet::decode(&bytes)?;
    if SystemPacketType::from_identifier(packet.identifier()) == Some(SystemPacketType::Disconnect)
    {
        return Err(ProtocolError::DisconnectDuringHandshake.into());
    }
    if packet.identifier() != SystemPacketType::Handshake.identifier() {
        return Err(ProtocolError::UnexpectedHandshakePacket {
            expected: SystemPacketType::Handshake.identifier().value(),
            got: packet.identifier().value(),
        }
        .into());
    }
    Ok(packet.into_payload())
}

fn signed_transcript(challenge: &[u8; 32], client_eph: &[u8], server_eph: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(32 + client_eph.len() + server_eph.len());
    message.extend_from_slice(challenge);
    message.extend_from_slice(client_eph);
    message.extend_from_slice(server_eph);
    message
}

/// Drive the server side of the handshake to completion over an
/// already-accepted stream.
pub async fn run_server_handshake<S>(
    stream: &mut S,
    identity: &ServerIdentity,
    max_packet_size: u32,
    pool: &Arc<BufferPool>,
) -> Result<ServerHandshakeOutcome, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1. S -> C: identity public key.
    send_handshake_packet(stream, identity.public_key_spki()).await?;

    // 3. C -> S: challenge + client ephemeral.
    let payload = recv_handshake_payload(stream, max_packet_size, pool).await?;
    let client_handshake: ClientHandshake =
        bincode::deserialize(&payload).map_err(|e| ProtocolError::Codec(e.to_string()))?;

    // 4. S -> C: server ephemeral + signature over the transcript.
    let server_eph = EphemeralKeyPair::generate();
    let server_point = server_eph.public_point();
    let message = signed_transcript(
        &client_handshake.challenge,
        &client_handshake.client_ephemeral_public,
        &server_point,
    );
    let signature = identity.sign(&message);
    let server_handshake = ServerHandshake {
        server_ephemeral_public: server_point,
        signature,
    };
    let payload = bincode::serialize(&server_handshake)
        .map_err(|e| ProtocolError::Codec(e.to_string()))?;
    send_handshake_packet(stream, payload).await?;

    // 6. Derive the session key.
    let client_point = decode_public_point(&client_handshake.client_ephemeral_public)?;
    let key = server_eph.derive_session_key(&client_point);

    Ok(ServerHandshakeOutcome {
        cipher: SessionCipher::new(&key),
    })
}

/// Drive the client side of the handshake to completion over an
/// already-connected stream, consulting and updating `trust_store` per
/// TOFU policy.
pub async fn run_client_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    trust_store: &TrustStore,
    max_packet_size: u32,
    pool: &Arc<BufferPool>,
) -> Result<ClientHandshakeOutcome, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1/2. S -> C: identity public key; verify (or record) via TOFU.
    let server_public_key = recv_handshake_payload(stream, max_packet_size, pool).await?;
    if !trust_store.verify_or_trust(host, port, &server_public_key)? {
        let expected = trust_store
            .pinned_fingerprint(host, port)
            .unwrap_or_default();
        return Err(IdentityError::FingerprintMismatch {
            host: host.to_string(),
            port,
            expected,
            actual: fingerprint(&server_public_key),
        }
        .into());
    }

    // 3. C -> S: fresh challenge + client ephemeral.
    let mut challenge = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);
    let client_eph = EphemeralKeyPair::generate();
    let client_point = client_eph.public_point();
    let client_handshake = ClientHandshake {
        challenge,
        client_ephemeral_public: client_point.clone(),
    };
    let payload = bincode::serialize(&client_handshake)
        .map_err(|e| ProtocolError::Codec(e.to_string()))?;
    send_handshake_packet(stream, payload).await?;

    // 4/5. S -> C: server ephemeral + signature; verify against the
    // pinned identity key.
    let payload = recv_handshake_payload(stream, max_packet_size, pool).await?;
    let server_handshake: ServerHandshake =
        bincode::deserialize(&payload).map_err(|e| ProtocolError::Codec(e.to_string()))?;

    let message = signed_transcript(
        &challenge,
        &client_point,
        &server_handshake.server_ephemeral_public,
    );
    if !verify_signature(&server_public_key, &message, &server_handshake.signature) {
        return Err(IdentityError::BadSignature.into());
    }

    // 6. Derive the session key.
    let server_point = decode_public_point(&server_handshake.server_ephemeral_public)?;
    let key = client_eph.derive_session_key(&server_point);

    Ok(ClientHandshakeOutcome {
        cipher: SessionCipher::new(&key),
        server_public_key,
    })
}
