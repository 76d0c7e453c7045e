//! Anchor chain
//!
//! An append-only, hash-linked log of one session's significant events.
//! Each anchor commits to its predecessor:
//!
//! ```text
//! hash = SHA-256(prev_hash_hex || canonical({type, data, summary, metadata}))
//! ```
//!
//! The first anchor links to a genesis value derived from the session id, so
//! anchors from one session can never verify as part of another. At session
//! end the chain is sealed with a merkle root over the anchor hashes.
//!
//! Merkle rule: `leaf = SHA-256(0x00 || hash)`, `node = SHA-256(0x01 || l || r)`.
//! An unpaired node at the end of a level is promoted to the next level
//! unchanged. The root of an empty chain is SHA-256 of the empty string.

use crate::canonicalize::{canonical_bytes, sha256_hex};
use crate::errors::{AgidError, AgidResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

pub const GENESIS_PREFIX: &str = "agidentity:anchor-genesis:";
pub const COMMITMENT_PROTOCOL: &str = "agidentity-anchor-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    SessionStart,
    ToolCall,
    IntegrityWarning,
    SessionEnd,
}

impl fmt::Display for AnchorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnchorType::SessionStart => "session_start",
            AnchorType::ToolCall => "tool_call",
            AnchorType::IntegrityWarning => "integrity_warning",
            AnchorType::SessionEnd => "session_end",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    #[serde(rename = "type")]
    pub anchor_type: AnchorType,
    pub data: Value,
    pub summary: String,
    pub metadata: Value,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct AnchorContent<'a> {
    #[serde(rename = "type")]
    anchor_type: AnchorType,
    data: &'a Value,
    summary: &'a str,
    metadata: &'a Value,
}

fn anchor_hash(
    prev_hash: &str,
    anchor_type: AnchorType,
    data: &Value,
    summary: &str,
    metadata: &Value,
) -> AgidResult<String> {
    let mut preimage = prev_hash.as_bytes().to_vec();
    preimage.extend(canonical_bytes(&AnchorContent {
        anchor_type,
        data,
        summary,
        metadata,
    })?);
    Ok(sha256_hex(&preimage))
}

pub fn genesis_hash(session_id: &str) -> String {
    sha256_hex(format!("{GENESIS_PREFIX}{session_id}").as_bytes())
}

/// Result of recomputing a chain from its stored content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub valid: bool,
    pub anchor_count: usize,
    /// First anchor whose link or hash does not recompute. Equal to
    /// `anchor_count` when every anchor checks out but the head does not.
    pub first_divergent_index: Option<usize>,
    pub recomputed_head: String,
}

/// Serialized chain, as persisted and as consumed by external verifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRecord {
    pub session_id: String,
    pub agent_public_key: String,
    pub anchors: Vec<Anchor>,
    pub head_hash: String,
    pub merkle_root: Option<String>,
}

/// What gets committed on the external ledger at session end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentRecord {
    pub protocol: String,
    pub session_id: String,
    pub agent_public_key: String,
    pub merkle_root: String,
    pub head_hash: String,
    pub workspace_hash: Option<String>,
    pub anchor_count: usize,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStep {
    pub hash: String,
    pub side: Side,
}

/// Inclusion proof for one anchor hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub index: usize,
    pub anchor_hash: String,
    pub steps: Vec<ProofStep>,
}

fn leaf_digest(anchor_hash: &str) -> AgidResult<[u8; 32]> {
    let bytes = hex::decode(anchor_hash)
        .map_err(|e| AgidError::integrity(format!("anchor hash is not hex: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

fn node_digest(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => node_digest(left, right),
            // unpaired: promoted as-is
            _ => pair[0],
        })
        .collect()
}

/// Merkle root over ordered anchor hashes.
pub fn merkle_root(anchor_hashes: &[String]) -> AgidResult<String> {
    if anchor_hashes.is_empty() {
        return Ok(sha256_hex(b""));
    }
    let mut level = anchor_hashes
        .iter()
        .map(|h| leaf_digest(h))
        .collect::<AgidResult<Vec<_>>>()?;
    while level.len() > 1 {
        level = next_level(&level);
    }
    Ok(hex::encode(level[0]))
}

pub fn merkle_proof(anchor_hashes: &[String], index: usize) -> AgidResult<MerkleProof> {
    if index >= anchor_hashes.len() {
        return Err(AgidError::not_found("anchor", index.to_string()));
    }
    let mut level = anchor_hashes
        .iter()
        .map(|h| leaf_digest(h))
        .collect::<AgidResult<Vec<_>>>()?;
    let mut position = index;
    let mut steps = Vec::new();
    while level.len() > 1 {
        let sibling = position ^ 1;
        if sibling < level.len() {
            steps.push(ProofStep {
                hash: hex::encode(level[sibling]),
                side: if sibling < position { Side::Left } else { Side::Right },
            });
        }
        level = next_level(&level);
        position /= 2;
    }
    Ok(MerkleProof {
        index,
        anchor_hash: anchor_hashes[index].clone(),
        steps,
    })
}

impl MerkleProof {
    pub fn verify(&self, root: &str) -> bool {
        let mut current = match leaf_digest(&self.anchor_hash) {
            Ok(d) => d,
            Err(_) => return false,
        };
        for step in &self.steps {
            let decoded: Option<[u8; 32]> =
                hex::decode(&step.hash).ok().and_then(|b| b.try_into().ok());
            let sibling: [u8; 32] = match decoded {
                Some(s) => s,
                None => return false,
            };
            current = match step.side {
                Side::Left => node_digest(&sibling, &current),
                Side::Right => node_digest(&current, &sibling),
            };
        }
        hex::encode(current) == root
    }
}

pub struct AnchorChain {
    session_id: String,
    agent_public_key: String,
    anchors: Vec<Anchor>,
    head_hash: String,
    merkle_root: Option<String>,
}

impl AnchorChain {
    pub fn new(session_id: impl Into<String>, agent_public_key: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let head_hash = genesis_hash(&session_id);
        Self {
            session_id,
            agent_public_key: agent_public_key.into(),
            anchors: Vec::new(),
            head_hash,
            merkle_root: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn head_hash(&self) -> &str {
        &self.head_hash
    }

    pub fn is_sealed(&self) -> bool {
        self.merkle_root.is_some()
    }

    pub fn count_of(&self, anchor_type: AnchorType) -> usize {
        self.anchors.iter().filter(|a| a.anchor_type == anchor_type).count()
    }

    /// Append an anchor. A `timestamp` is added to object metadata if absent.
    pub fn add_anchor(
        &mut self,
        anchor_type: AnchorType,
        data: Value,
        summary: impl Into<String>,
        metadata: Value,
    ) -> AgidResult<&Anchor> {
        if self.is_sealed() {
            return Err(AgidError::integrity(format!(
                "anchor chain {} is sealed",
                self.session_id
            )));
        }

        let metadata = match metadata {
            Value::Object(mut map) => {
                map.entry("timestamp")
                    .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
                Value::Object(map)
            }
            Value::Null => {
                let mut map = Map::new();
                map.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
                Value::Object(map)
            }
            other => other,
        };
        let summary = summary.into();
        let prev_hash = self.head_hash.clone();
        let hash = anchor_hash(&prev_hash, anchor_type, &data, &summary, &metadata)?;

        self.anchors.push(Anchor {
            anchor_type,
            data,
            summary,
            metadata,
            prev_hash,
            hash: hash.clone(),
        });
        self.head_hash = hash;
        let index = self.anchors.len() - 1;
        Ok(&self.anchors[index])
    }

    fn anchor_hashes(&self) -> Vec<String> {
        self.anchors.iter().map(|a| a.hash.clone()).collect()
    }

    pub fn merkle_root(&self) -> AgidResult<String> {
        merkle_root(&self.anchor_hashes())
    }

    pub fn merkle_proof(&self, index: usize) -> AgidResult<MerkleProof> {
        merkle_proof(&self.anchor_hashes(), index)
    }

    /// Recompute every hash from stored content.
    pub fn verify(&self) -> ChainVerification {
        verify_anchors(&self.session_id, &self.anchors, &self.head_hash)
    }

    /// Freeze the chain and fix its merkle root.
    pub fn seal(&mut self) -> AgidResult<String> {
        if let Some(root) = &self.merkle_root {
            return Ok(root.clone());
        }
        let root = self.merkle_root()?;
        self.merkle_root = Some(root.clone());
        Ok(root)
    }

    pub fn commitment_record(
        &self,
        workspace_hash: Option<String>,
    ) -> AgidResult<CommitmentRecord> {
        let merkle_root = match &self.merkle_root {
            Some(root) => root.clone(),
            None => self.merkle_root()?,
        };
        Ok(CommitmentRecord {
            protocol: COMMITMENT_PROTOCOL.to_string(),
            session_id: self.session_id.clone(),
            agent_public_key: self.agent_public_key.clone(),
            merkle_root,
            head_hash: self.head_hash.clone(),
            workspace_hash,
            anchor_count: self.anchors.len(),
            created_at: Utc::now().to_rfc3339(),
        })
    }

    pub fn to_record(&self) -> ChainRecord {
        ChainRecord {
            session_id: self.session_id.clone(),
            agent_public_key: self.agent_public_key.clone(),
            anchors: self.anchors.clone(),
            head_hash: self.head_hash.clone(),
            merkle_root: self.merkle_root.clone(),
        }
    }

    /// Rebuild a chain from a stored record. The record is taken as-is;
    /// call [`verify`](Self::verify) to check it.
    pub fn from_record(record: ChainRecord) -> Self {
        Self {
            session_id: record.session_id,
            agent_public_key: record.agent_public_key,
            anchors: record.anchors,
            head_hash: record.head_hash,
            merkle_root: record.merkle_root,
        }
    }
}

fn verify_anchors(session_id: &str, anchors: &[Anchor], head_hash: &str) -> ChainVerification {
    let mut running = genesis_hash(session_id);
    let mut first_divergent_index = None;

    for (i, anchor) in anchors.iter().enumerate() {
        let recomputed = anchor_hash(
            &running,
            anchor.anchor_type,
            &anchor.data,
            &anchor.summary,
            &anchor.metadata,
        )
        .unwrap_or_default();
        let diverged = anchor.prev_hash != running || anchor.hash != recomputed;
        if first_divergent_index.is_none() && diverged {
            first_divergent_index = Some(i);
        }
        running = recomputed;
    }

    if first_divergent_index.is_none() && running != head_hash {
        first_divergent_index = Some(anchors.len());
    }

    ChainVerification {
        valid: first_divergent_index.is_none(),
        anchor_count: anchors.len(),
        first_divergent_index,
        recomputed_head: running,
    }
}

/// Full offline check of a serialized chain: hashes, head and merkle root.
pub fn verify_record(record: &ChainRecord) -> AgidResult<ChainVerification> {
    let mut verification = verify_anchors(&record.session_id, &record.anchors, &record.head_hash);
    if let Some(root) = &record.merkle_root {
        let hashes: Vec<String> = record.anchors.iter().map(|a| a.hash.clone()).collect();
        if verification.valid && &merkle_root(&hashes)? != root {
            verification.valid = false;
            verification.first_divergent_index = Some(record.anchors.len());
        }
    }
    Ok(verification)
}

/// Short description of tool input for anchoring; long inputs are hashed.
pub fn summarize_input(input: &Value) -> String {
    let rendered = input.to_string();
    if rendered.chars().count() <= 120 {
        rendered
    } else {
        let head: String = rendered.chars().take(100).collect();
        format!("{head}... (sha256:{})", sha256_hex(rendered.as_bytes()))
    }
}

pub fn tool_call_data(tool: &str, input: &Value, output: &str, is_error: bool) -> Value {
    json!({
        "tool": tool,
        "inputSummary": summarize_input(input),
        "outputHash": sha256_hex(output.as_bytes()),
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_with(n: usize) -> AnchorChain {
        let mut chain = AnchorChain::new("session-1", "agent-key");
        for i in 0..n {
            chain
                .add_anchor(
                    AnchorType::ToolCall,
                    json!({"i": i}),
                    format!("call {i}"),
                    json!({"timestamp": "2026-01-01T00:00:00Z"}),
                )
                .unwrap();
        }
        chain
    }

    #[test]
    fn test_first_anchor_links_to_session_genesis() {
        let chain = chain_with(1);
        assert_eq!(chain.anchors()[0].prev_hash, genesis_hash("session-1"));
        assert_ne!(genesis_hash("session-1"), genesis_hash("session-2"));
        assert!(chain.verify().valid);
    }

    #[test]
    fn test_mutation_reports_first_divergent_index() {
        for target in 0..4 {
            let mut record = chain_with(5).to_record();
            record.anchors[target].summary = "tampered".to_string();
            let chain = AnchorChain::from_record(record);
            let result = chain.verify();
            assert!(!result.valid);
            assert_eq!(result.first_divergent_index, Some(target));
            assert_ne!(result.recomputed_head, chain.head_hash());
        }
    }

    #[test]
    fn test_same_anchors_in_other_session_do_not_verify() {
        let mut record = chain_with(3).to_record();
        record.session_id = "session-2".to_string();
        assert_eq!(
            AnchorChain::from_record(record).verify().first_divergent_index,
            Some(0)
        );
    }

    #[test]
    fn test_truncation_detected_at_head() {
        let mut record = chain_with(3).to_record();
        record.anchors.pop();
        let result = AnchorChain::from_record(record).verify();
        assert_eq!(result.first_divergent_index, Some(2));
    }

    #[test]
    fn test_empty_root_is_hash_of_empty_string() {
        assert_eq!(
            AnchorChain::new("s", "k").merkle_root().unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_merkle_root_deterministic_across_serializations() {
        let chain = chain_with(5);
        let json = serde_json::to_string(&chain.to_record()).unwrap();
        let reparsed: ChainRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(
            AnchorChain::from_record(reparsed).merkle_root().unwrap(),
            chain.merkle_root().unwrap()
        );
        assert_ne!(chain_with(4).merkle_root().unwrap(), chain.merkle_root().unwrap());
    }

    #[test]
    fn test_odd_leaf_is_promoted_not_duplicated() {
        // With duplication, [a, b, c] and [a, b, c, c] would share a root.
        let three = chain_with(3);
        let mut hashes: Vec<String> = three.anchors().iter().map(|a| a.hash.clone()).collect();
        let root3 = merkle_root(&hashes).unwrap();
        hashes.push(hashes[2].clone());
        assert_ne!(root3, merkle_root(&hashes).unwrap());

        // Single leaf root is the leaf digest itself.
        let one = chain_with(1);
        assert_eq!(
            one.merkle_root().unwrap(),
            hex::encode(leaf_digest(&one.anchors()[0].hash).unwrap())
        );
    }

    #[test]
    fn test_inclusion_proofs_for_every_index() {
        for n in 1..=9 {
            let chain = chain_with(n);
            let root = chain.merkle_root().unwrap();
            for i in 0..n {
                let proof = chain.merkle_proof(i).unwrap();
                assert!(proof.verify(&root), "n={n} i={i}");
            }
            let mut bad = chain.merkle_proof(0).unwrap();
            bad.anchor_hash = chain_with(n + 1).anchors()[n].hash.clone();
            assert!(!bad.verify(&root));
        }
        assert!(chain_with(2).merkle_proof(2).is_err());
    }

    #[test]
    fn test_sealed_chain_rejects_appends() {
        let mut chain = chain_with(2);
        let root = chain.seal().unwrap();
        assert!(chain.add_anchor(AnchorType::SessionEnd, json!({}), "end", Value::Null).is_err());
        let record = chain.to_record();
        assert_eq!(record.merkle_root.as_deref(), Some(root.as_str()));
        assert!(verify_record(&record).unwrap().valid);
    }

    #[test]
    fn test_tool_call_data_hashes_output() {
        let data = tool_call_data("current_time", &json!({}), "2026", false);
        assert_eq!(data["outputHash"], sha256_hex(b"2026"));
        assert_eq!(data["inputSummary"], "{}");
        let long = json!({"text": "x".repeat(500)});
        assert!(summarize_input(&long).contains("sha256:"));
    }
}
