//! Library root for the `agidentity` crate
//! Identity-gated agent gateway with signed, anchored sessions

// Core error handling
pub mod errors;

// Canonical encoding
pub mod canonicalize;

// Identity key and signing capability
pub mod keys;
pub mod remote_signer;
pub mod signer;

// Certificates and admission
pub mod certificate;
pub mod identity_gate;
pub mod revocation;

// Conversations and encryption
pub mod conversation;
pub mod history;
pub mod session_encryption;

// Reasoning loop
pub mod agent_loop;
pub mod model;
pub mod tools;

// Tamper evidence
pub mod anchor_chain;
pub mod anchor_store;
pub mod audit_trail;
pub mod workspace;

// Orchestration and transport
pub mod gateway;
pub mod messages;
pub mod pump;
pub mod rate_limiter;
pub mod transport;

// Configuration, CLI and HTTP surface
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod logging;
pub mod web;

#[cfg(test)]
mod tests {
    pub mod test_utils;
    pub mod identity_gate_tests;
    pub mod session_encryption_tests;
    pub mod agent_loop_tests;
    pub mod gateway_tests;
}

pub use agent_loop::{AgentLoop, AgentRunOutcome, LoopInput, LoopState};
pub use anchor_chain::{AnchorChain, AnchorType, ChainRecord, ChainVerification, MerkleProof};
pub use anchor_store::{AnchorStore, MemoryAnchorStore, SledAnchorStore};
pub use audit_trail::{AuditEntry, SignedAuditTrail};
pub use errors::{AgidError, AgidResult};
pub use gateway::Gateway;
pub use identity_gate::{IdentityGate, IdentityVerificationResult};
pub use messages::{InboundEnvelope, OutboundEnvelope, ProgressEvent};
pub use signer::{LocalSigner, Signer, SigningCapability};
