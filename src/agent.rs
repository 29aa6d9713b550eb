//! # Agent Cards
//!
//! An agent card describes a peer: identity, public key, endpoint, and
//! capabilities. Cards are owned by the registry; the core holds
//! short-lived copies and never mutates them at runtime.

use std::collections::BTreeSet;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::token;

/// The registry record describing an agent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    /// Opaque unique agent id.
    pub agent_id: String,

    /// Human-readable name.
    pub name: String,

    /// Optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// PEM-encoded public key that verifies the agent's tokens.
    pub public_key: String,

    /// Base URL of the agent's service, if reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,

    /// Capability names the agent advertises.
    #[serde(default)]
    pub skills: BTreeSet<String>,

    /// Free-form card metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AgentCard {
    /// Check the card's invariants: a non-empty id and a public key that
    /// parses for `algorithm`.
    ///
    /// # Errors
    ///
    /// Fails with `AgentUnknown` for an empty id and
    /// `TokenSignatureInvalid` for unusable key material.
    pub fn validate(&self, algorithm: Algorithm) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(Error::AgentUnknown("agent card has an empty id".to_string()));
        }
        token::decoding_key(algorithm, &self.public_key)
            .map_err(|_| Error::TokenSignatureInvalid("agent card key rejected".to_string()))?;
        Ok(())
    }
}

/// The `/.well-known/agent.json` projection of the self-agent card. The
/// host serves it read-only, without authentication.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryDocument {
    /// Document schema version.
    pub schema_version: String,

    /// Agent name.
    pub name: String,

    /// Agent description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Service base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,

    /// Advertised skills.
    pub skills: Vec<SkillEntry>,

    /// Accepted security schemes; always bearer.
    pub security_schemes: Value,

    /// The agent's PEM-encoded public key.
    pub public_key: String,

    /// Card metadata, passed through.
    pub metadata: Map<String, Value>,
}

/// One advertised skill.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SkillEntry {
    /// Skill name.
    pub name: String,

    /// Optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&AgentCard> for DiscoveryDocument {
    fn from(card: &AgentCard) -> Self {
        Self {
            schema_version: "1.0".to_string(),
            name: card.name.clone(),
            description: card.description.clone(),
            service_url: card.service_url.clone(),
            skills: card
                .skills
                .iter()
                .map(|name| SkillEntry { name: name.clone(), description: None })
                .collect(),
            security_schemes: json!({ "bearer": { "type": "bearer", "scheme": "bearer" } }),
            public_key: card.public_key.clone(),
            metadata: card.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUB: &str = include_str!("../tests/fixtures/bob.pub.pem");

    fn card() -> AgentCard {
        AgentCard {
            agent_id: "bob".to_string(),
            name: "Bob".to_string(),
            public_key: PUB.to_string(),
            skills: BTreeSet::from(["summarize".to_string()]),
            ..AgentCard::default()
        }
    }

    #[test]
    fn validates() {
        card().validate(Algorithm::RS256).expect("card should validate");

        let mut bad = card();
        bad.agent_id = " ".to_string();
        bad.validate(Algorithm::RS256).expect_err("blank id should fail");

        let mut bad = card();
        bad.public_key = "garbage".to_string();
        bad.validate(Algorithm::RS256).expect_err("bad key should fail");
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let value = serde_json::to_value(card()).expect("should serialize");
        assert!(value.get("agentId").is_some());
        assert!(value.get("publicKey").is_some());
        assert!(value.get("agent_id").is_none());
    }

    #[test]
    fn discovery_projection() {
        let doc = DiscoveryDocument::from(&card());
        let value = serde_json::to_value(&doc).expect("should serialize");

        assert_eq!(value["schemaVersion"], "1.0");
        assert_eq!(value["securitySchemes"]["bearer"]["scheme"], "bearer");
        assert_eq!(value["skills"][0]["name"], "summarize");
        assert_eq!(value["publicKey"], PUB);
    }
}
