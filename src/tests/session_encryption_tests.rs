use crate::errors::AgidError;
use crate::session_encryption::{KeyId, SessionEncryption};
use crate::signer::{LocalSigner, Network, SigningCapability};
use crate::tests::test_utils::TEST_TIMEOUT;
use std::sync::Arc;

struct Pair {
    agent: SessionEncryption,
    peer: SessionEncryption,
}

fn capability() -> SigningCapability {
    SigningCapability::new(Arc::new(LocalSigner::generate(Network::Local)), TEST_TIMEOUT)
}

fn pair(session_id: &str) -> Pair {
    let agent_cap = capability();
    let peer_cap = capability();
    Pair {
        agent: SessionEncryption::new(
            session_id,
            peer_cap.identity().public_key.clone(),
            agent_cap.clone(),
        ),
        peer: SessionEncryption::new(session_id, agent_cap.identity().public_key.clone(), peer_cap),
    }
}

#[tokio::test]
async fn test_each_message_gets_its_own_key_id() {
    let mut p = pair("conv-1");
    let first = p.peer.encrypt_outbound(b"one").await.unwrap();
    let second = p.peer.encrypt_outbound(b"two").await.unwrap();

    assert_ne!(first.key_id, second.key_id);
    assert_eq!((first.message_index, second.message_index), (0, 1));
    assert_eq!(p.peer.next_outbound_index(), 2);
    assert_eq!(KeyId::parse(&second.key_id).unwrap().session_id, "conv-1");
}

#[tokio::test]
async fn test_counterparty_decrypts_in_order() {
    let mut p = pair("conv-1");
    for text in ["hello", "how are you", "bye"] {
        let message = p.peer.encrypt_outbound(text.as_bytes()).await.unwrap();
        let plaintext = p.agent.decrypt_inbound(&message).await.unwrap();
        assert_eq!(plaintext, text.as_bytes());
    }

    let reply = p.agent.encrypt_outbound(b"pong").await.unwrap();
    assert_eq!(p.peer.decrypt_inbound(&reply).await.unwrap(), b"pong");
}

#[tokio::test]
async fn test_replayed_or_stale_index_rejected() {
    let mut p = pair("conv-1");
    let m0 = p.peer.encrypt_outbound(b"zero").await.unwrap();
    let m1 = p.peer.encrypt_outbound(b"one").await.unwrap();

    p.agent.decrypt_inbound(&m1).await.unwrap();
    assert!(matches!(p.agent.decrypt_inbound(&m1).await, Err(AgidError::Crypto { .. })));
    assert!(p.agent.decrypt_inbound(&m0).await.is_err());
}

#[tokio::test]
async fn test_rewritten_key_id_does_not_decrypt() {
    let mut p = pair("conv-1");
    let mut message = p.peer.encrypt_outbound(b"secret").await.unwrap();

    // Consistent metadata pointing at a different message key.
    let mut key_id = KeyId::parse(&message.key_id).unwrap();
    key_id.message_index = 5;
    message.key_id = key_id.format();
    message.message_index = 5;

    assert!(p.agent.decrypt_inbound(&message).await.is_err());
}

#[tokio::test]
async fn test_metadata_must_match_key_id() {
    let mut p = pair("conv-1");
    let mut message = p.peer.encrypt_outbound(b"secret").await.unwrap();
    message.message_index = 9;
    assert!(p.agent.decrypt_inbound(&message).await.is_err());
}

#[tokio::test]
async fn test_message_from_other_session_rejected() {
    let agent_cap = capability();
    let peer_cap = capability();
    let peer_key = peer_cap.identity().public_key.clone();
    let mut peer =
        SessionEncryption::new("conv-a", agent_cap.identity().public_key.clone(), peer_cap);
    let mut agent = SessionEncryption::new("conv-b", peer_key, agent_cap);

    let message = peer.encrypt_outbound(b"wrong room").await.unwrap();
    assert!(agent.decrypt_inbound(&message).await.is_err());
}

#[tokio::test]
async fn test_signed_envelope_verifies_and_decrypts() {
    let mut p = pair("conv-1");
    let envelope = p.peer.encrypt_outbound_signed(b"signed hello").await.unwrap();

    p.agent.verify_envelope(&envelope).unwrap();
    assert_eq!(p.agent.decrypt_signed_inbound(&envelope).await.unwrap(), b"signed hello");
}

#[tokio::test]
async fn test_tampered_envelope_rejected_before_decryption() {
    let mut p = pair("conv-1");
    let envelope = p.peer.encrypt_outbound_signed(b"signed hello").await.unwrap();

    let mut bad_hash = envelope.clone();
    bad_hash.message.ciphertext = bad_hash.message.ciphertext.chars().rev().collect();
    assert!(matches!(
        p.agent.decrypt_signed_inbound(&bad_hash).await,
        Err(AgidError::Integrity { .. })
    ));

    let mut bad_signature = envelope.clone();
    bad_signature.message.timestamp += 1;
    assert!(p.agent.verify_envelope(&bad_signature).is_err());

    // The untouched envelope still goes through: nothing above consumed an index.
    p.agent.decrypt_signed_inbound(&envelope).await.unwrap();
}

#[tokio::test]
async fn test_envelope_from_third_party_rejected() {
    let mut p = pair("conv-1");
    let stranger_cap = capability();
    let agent_key = p.peer.counterparty().to_string();
    let mut stranger = SessionEncryption::new("conv-1", agent_key, stranger_cap);

    let envelope = stranger.encrypt_outbound_signed(b"let me in").await.unwrap();
    assert!(matches!(
        p.agent.decrypt_signed_inbound(&envelope).await,
        Err(AgidError::Auth { .. })
    ));
}

#[tokio::test]
async fn test_own_message_reflected_back_rejected() {
    let mut p = pair("conv-1");
    let own = p.agent.encrypt_outbound(b"agent said this").await.unwrap();
    assert!(matches!(
        p.agent.decrypt_inbound(&own).await,
        Err(AgidError::Auth { .. })
    ));

    // The rejection did not consume an inbound index.
    let from_peer = p.peer.encrypt_outbound(b"peer said this").await.unwrap();
    assert_eq!(p.agent.decrypt_inbound(&from_peer).await.unwrap(), b"peer said this");
}

#[tokio::test]
async fn test_peers_never_share_a_key_id() {
    let mut p = pair("conv-1");
    let from_agent = p.agent.encrypt_outbound(b"a").await.unwrap();
    let from_peer = p.peer.encrypt_outbound(b"b").await.unwrap();
    assert_eq!(from_agent.message_index, from_peer.message_index);

    let agent_id = KeyId::parse(&from_agent.key_id).unwrap();
    let peer_id = KeyId::parse(&from_peer.key_id).unwrap();
    assert_ne!(agent_id.sender, peer_id.sender);
    assert_eq!(agent_id.sender, p.peer.counterparty());
}
