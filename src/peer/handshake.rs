//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both peers are participating in the same torrent (via
//! info_hash) and establishes basic protocol compatibility.
use super::{PeerError, PeerResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::instrument;

/// A peer that has not completed the handshake within this window is
/// dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/** Represents a BitTorrent handshake message as defined in the BitTorrent
protocol.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_len: u8,
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /** Creates a new handshake with the specified info hash and peer ID.

    Arguments:
    - info_hash - The SHA-1 hash of the torrent's info dictionary
    - peer_id - A unique identifier for this client */
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol_len: 19,
            protocol: *b"BitTorrent protocol",
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /** Serializes the handshake into a 68-byte array as per the BitTorrent
    protocol.

    The serialized format is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved bytes (all zeros)
    - 20 bytes: info hash
    - 20 bytes: peer ID */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = self.protocol_len;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /**
    Reads and parses a handshake from the stream.

    Reads exactly 68 bytes and validates the protocol length and protocol
    string.

    # Errors
    - An underlying I/O error (e.g. connection closed mid-handshake)
    - `protocol_len` is not 19
    - The protocol string is not "BitTorrent protocol"
    */
    #[instrument(level = "trace", skip(stream))]
    pub async fn read<R>(stream: &mut R) -> PeerResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        let protocol_len = length_buf[0];

        if protocol_len != 19 {
            return Err(PeerError::HandshakeInvalidProtocol);
        }

        let mut buf = [0u8; 67];
        stream.read_exact(&mut buf).await?;

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[0..19]);
        if &protocol != b"BitTorrent protocol" {
            return Err(PeerError::HandshakeInvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            protocol_len,
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /** Validates that this handshake's info hash matches the expected
    value.

    Errors:
    Returns an error if the info hash in this handshake doesn't match the
    expected value */
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::HandshakeInfoHashMismatch);
        }
        Ok(())
    }
}

/// Performs the full handshake exchange on an established connection.
///
/// For an outbound connection we send our handshake first and then read the
/// remote one; for an inbound connection the remote speaks first. In both
/// cases the remote info hash must match ours byte-for-byte, and the whole
/// exchange must finish within [`HANDSHAKE_TIMEOUT`].
///
/// Returns the remote handshake on success.
#[instrument(level = "debug", skip(stream, info_hash, peer_id))]
pub async fn exchange<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    inbound: bool,
) -> PeerResult<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(HANDSHAKE_TIMEOUT, async {
        let ours = Handshake::new(info_hash, peer_id);
        if inbound {
            let theirs = Handshake::read(stream).await?;
            theirs.validate(info_hash)?;
            stream.write_all(&ours.serialize()).await?;
            Ok(theirs)
        } else {
            stream.write_all(&ours.serialize()).await?;
            let theirs = Handshake::read(stream).await?;
            theirs.validate(info_hash)?;
            Ok(theirs)
        }
    })
    .await
    .map_err(|_| PeerError::HandshakeTimeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_HASH: [u8; 20] = [0x11; 20];
    const OUR_ID: [u8; 20] = *b"-PC0001-123456789012";
    const THEIR_ID: [u8; 20] = *b"-PC0001-210987654321";

    #[test]
    fn serializes_to_68_bytes() {
        let handshake = Handshake::new(INFO_HASH, OUR_ID);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &INFO_HASH);
        assert_eq!(&bytes[48..68], &OUR_ID);
    }

    #[tokio::test]
    async fn reads_back_serialized_handshake() {
        let original = Handshake::new(INFO_HASH, THEIR_ID);
        let mut stream = std::io::Cursor::new(original.serialize().to_vec());
        let parsed = Handshake::read(&mut stream).await.expect("read");
        assert_eq!(parsed, original);
    }

    #[tokio::test]
    async fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new(INFO_HASH, THEIR_ID).serialize().to_vec();
        bytes[1] = b'X';
        let mut stream = std::io::Cursor::new(bytes);
        assert!(matches!(
            Handshake::read(&mut stream).await,
            Err(PeerError::HandshakeInvalidProtocol)
        ));
    }

    #[test]
    fn validate_detects_info_hash_mismatch() {
        let mut other_hash = INFO_HASH;
        other_hash[19] ^= 0x01;
        let theirs = Handshake::new(other_hash, THEIR_ID);
        assert!(matches!(
            theirs.validate(INFO_HASH),
            Err(PeerError::HandshakeInfoHashMismatch)
        ));
    }

    #[tokio::test]
    async fn exchange_completes_between_both_roles() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let server_task = tokio::spawn(async move {
            exchange(&mut server, INFO_HASH, THEIR_ID, true).await
        });

        let theirs = exchange(&mut client, INFO_HASH, OUR_ID, false)
            .await
            .expect("outbound handshake");
        assert_eq!(theirs.peer_id, THEIR_ID);

        let ours_seen = server_task.await.unwrap().expect("inbound handshake");
        assert_eq!(ours_seen.peer_id, OUR_ID);
    }

    #[tokio::test]
    async fn exchange_fails_on_info_hash_mismatch() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut wrong_hash = INFO_HASH;
        wrong_hash[0] ^= 0x01;

        // remote peer answers with a handshake for a different torrent
        let server_task = tokio::spawn(async move {
            let mut theirs = [0u8; 68];
            server.read_exact(&mut theirs).await.unwrap();
            server
                .write_all(&Handshake::new(wrong_hash, THEIR_ID).serialize())
                .await
                .unwrap();
            server
        });

        let result = exchange(&mut client, INFO_HASH, OUR_ID, false).await;
        assert!(matches!(result, Err(PeerError::HandshakeInfoHashMismatch)));
        drop(server_task.await.unwrap());
    }
}
