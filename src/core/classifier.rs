//! Attack classification.
//!
//! The classifier is an optional external text-classification service. It is
//! treated as unreliable: any error or missing service resolves to the static
//! fallback table, and callers go through [`classify_or_fallback`].

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::core::attack::{AttackType, Classification};
use crate::core::packet::{Protocol, TcpFlags};
use crate::models::ClassifierConfig;

/// Errors that can occur while talking to the classifier service
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),
    #[error("Classifier not configured")]
    NotConfigured,
}

/// What the detector knew when it fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttackContext {
    pub destination: IpAddr,
    pub protocol: Protocol,
    pub packet_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<TcpFlags>,
}

/// Attack classifier
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify an attack attributed to `source`
    async fn classify(
        &self,
        attack_type: &AttackType,
        source: IpAddr,
        context: &AttackContext,
    ) -> Result<Classification, ClassifierError>;
}

/// Classify through `classifier`, falling back to the static table on any error
pub async fn classify_or_fallback(
    classifier: &dyn Classifier,
    attack_type: &AttackType,
    source: IpAddr,
    context: &AttackContext,
) -> Classification {
    match classifier.classify(attack_type, source, context).await {
        Ok(classification) => classification,
        Err(ClassifierError::NotConfigured) => fallback_classification(attack_type, source),
        Err(e) => {
            warn!("Classifier failed for {} from {}: {}", attack_type, source, e);
            fallback_classification(attack_type, source)
        }
    }
}

/// Static classification used when no classifier answer is available
pub fn fallback_classification(attack_type: &AttackType, source: IpAddr) -> Classification {
    match attack_type {
        AttackType::SynFlood => Classification {
            classification: "Denial of Service (DoS) - SYN Flood".to_string(),
            confidence: 90,
            description: format!(
                "SYN Flood attack detected from {}. Multiple SYN packets sent in short time \
                 window indicating TCP handshake abuse.",
                source
            ),
            impact: "Server resource exhaustion, service unavailability".to_string(),
            mitigation: "Block source IP, implement SYN cookies, rate limiting".to_string(),
        },
        AttackType::UdpFlood => Classification {
            classification: "Denial of Service (DoS) - UDP Flood".to_string(),
            confidence: 85,
            description: format!(
                "UDP Flood attack detected from {}. High volume of UDP packets targeting \
                 network services.",
                source
            ),
            impact: "Bandwidth exhaustion, service disruption".to_string(),
            mitigation: "Rate limiting, firewall rules, traffic filtering".to_string(),
        },
        AttackType::Other(name) => Classification {
            classification: "Suspicious Network Activity".to_string(),
            confidence: 70,
            description: format!("Detected {} from {}", name, source),
            impact: "Potential security risk".to_string(),
            mitigation: "Monitor and block if necessary".to_string(),
        },
    }
}

/// Classifier that always answers from the fallback table
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticClassifier;

#[async_trait]
impl Classifier for StaticClassifier {
    async fn classify(
        &self,
        attack_type: &AttackType,
        source: IpAddr,
        _context: &AttackContext,
    ) -> Result<Classification, ClassifierError> {
        Ok(fallback_classification(attack_type, source))
    }
}

/// Request body sent to the classification endpoint
#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    prompt: String,
    attack_type: &'a str,
    source_ip: IpAddr,
    context: &'a AttackContext,
}

/// Fields the service may return; anything missing gets a default
#[derive(Debug, Deserialize)]
struct ClassifyReply {
    classification: Option<String>,
    confidence: Option<f64>,
    description: Option<String>,
    impact: Option<String>,
    mitigation: Option<String>,
}

/// Classifier backed by an HTTP text-classification service
pub struct HttpClassifier {
    /// HTTP client
    client: Client,
    /// Classification endpoint
    endpoint: String,
    /// Bearer token, if the service needs one
    api_key: Option<String>,
}

impl HttpClassifier {
    /// Create a new classifier client
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or(ClassifierError::NotConfigured)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
        })
    }

    fn prompt(attack_type: &AttackType, source: IpAddr, context: &AttackContext) -> String {
        format!(
            "Analyze this network attack and provide classification:\n\n\
             Attack Type: {}\nSource IP: {}\nDestination IP: {}\nPackets: {}\n\n\
             Respond with JSON containing: classification, confidence (0-100), \
             description, impact, mitigation.",
            attack_type, source, context.destination, context.packet_count
        )
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        attack_type: &AttackType,
        source: IpAddr,
        context: &AttackContext,
    ) -> Result<Classification, ClassifierError> {
        let body = ClassifyRequest {
            prompt: Self::prompt(attack_type, source, context),
            attack_type: attack_type.as_str(),
            source_ip: source,
            context,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let text = request.send().await?.error_for_status()?.text().await?;
        parse_reply(&text, attack_type)
    }
}

/// Pull the first `{...}` object out of a free-text reply and fill defaults
fn parse_reply(text: &str, attack_type: &AttackType) -> Result<Classification, ClassifierError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => return Err(ClassifierError::InvalidResponse("no JSON object in reply".to_string())),
    };

    let reply: ClassifyReply = serde_json::from_str(json)
        .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;

    Ok(Classification {
        classification: reply
            .classification
            .unwrap_or_else(|| attack_type.to_string()),
        confidence: reply.confidence.unwrap_or(75.0).clamp(0.0, 100.0).round() as u8,
        description: reply
            .description
            .unwrap_or_else(|| format!("Detected {} attack", attack_type)),
        impact: reply
            .impact
            .unwrap_or_else(|| "Potential service disruption".to_string()),
        mitigation: reply
            .mitigation
            .unwrap_or_else(|| "Block source IP".to_string()),
    })
}
