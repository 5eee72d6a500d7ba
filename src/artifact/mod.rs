pub mod validation;

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Identity;

/// Current protocol version literal, published in DNS and carried in every
/// envelope.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Closed set of wire artifact types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    #[serde(rename = "TRUST_REQ")]
    TrustRequest,
    #[serde(rename = "TRUST_RES")]
    TrustResponse,
    #[serde(rename = "BTP_INVOICE")]
    Invoice,
    #[serde(rename = "BTP_AUTH_REQ")]
    AuthRequest,
    #[serde(rename = "BTP_AUTH_RES")]
    AuthResponse,
    #[serde(rename = "BTP_QUERY")]
    Query,
    #[serde(rename = "BTP_DELIVERY_FAILURE")]
    DeliveryFailure,
    #[serde(rename = "btps_response")]
    Response,
    #[serde(rename = "btps_error")]
    Error,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::TrustRequest => "TRUST_REQ",
            ArtifactKind::TrustResponse => "TRUST_RES",
            ArtifactKind::Invoice => "BTP_INVOICE",
            ArtifactKind::AuthRequest => "BTP_AUTH_REQ",
            ArtifactKind::AuthResponse => "BTP_AUTH_RES",
            ArtifactKind::Query => "BTP_QUERY",
            ArtifactKind::DeliveryFailure => "BTP_DELIVERY_FAILURE",
            ArtifactKind::Response => "btps_response",
            ArtifactKind::Error => "btps_error",
        }
    }

    /// Server response frames, as opposed to sender-originated artifacts.
    pub fn is_response_frame(&self) -> bool {
        matches!(self, ArtifactKind::Response | ArtifactKind::Error)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signature block attached to a signed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureBlock {
    /// Digest algorithm; always `sha256`.
    pub algorithm: String,
    /// base64 RSA signature over the canonical form.
    pub value: String,
    /// base64 SHA-256 of the signer's DER SPKI.
    pub fingerprint: String,
}

/// Wire encryption discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionType {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "standardEncrypt")]
    Standard,
    #[serde(rename = "2faEncrypt")]
    TwoFactor,
}

/// Encryption block attached when the document travels as ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionBlock {
    /// Payload cipher; always `aes-256-cbc`.
    pub algorithm: String,
    /// base64 RSA-OAEP-wrapped AES key.
    pub encrypted_key: String,
    /// base64 initialization vector.
    pub iv: String,
    #[serde(rename = "type")]
    pub kind: EncryptionType,
}

/// The outermost wire unit: one envelope per newline-delimited JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtpsEnvelope {
    /// Semantic protocol version triple.
    pub version: String,
    /// Opaque artifact identifier, recipient-unique per delivery attempt.
    pub id: String,
    pub from: Identity,
    pub to: Identity,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    /// RFC 3339 issue timestamp.
    pub issued_at: String,
    /// Typed payload, or the base64 ciphertext string when encrypted.
    pub document: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionBlock>,
    /// Identity that produced `signature`; present iff `signature` is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<Identity>,
    /// DNS key selector used for signing; present iff `signature` is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// On response frames, the `id` of the request being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
}

impl BtpsEnvelope {
    /// Start an unsigned envelope with a fresh id and an issue time of now.
    pub fn build(from: Identity, to: Identity, kind: ArtifactKind, document: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            from,
            to,
            kind,
            issued_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            document,
            signature: None,
            encryption: None,
            signed_by: None,
            selector: None,
            req_id: None,
        }
    }
}

/// A trust handshake request from a would-be sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRequestDoc {
    pub name: String,
    pub email: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The receiver's verdict on a trust request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustDecision {
    Accepted,
    Rejected,
    Revoked,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustResponseDoc {
    pub decision: TrustDecision,
    /// RFC 3339 moment the decision was made.
    pub decided_at: String,
    /// RFC 3339 expiry of an accepted trust, when bounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLineItem {
    pub description: String,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDoc {
    /// Issuer-side invoice number or reference.
    pub document_id: String,
    pub total_amount: f64,
    /// ISO 4217 currency code.
    pub currency: String,
    pub line_items: Vec<InvoiceLineItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequestDoc {
    /// Identity the agent wants to act for.
    pub identity: Identity,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponseDoc {
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailureDoc {
    pub reason: String,
    /// `id` of the artifact whose delivery failed.
    pub failed_artifact_id: String,
    /// RFC 3339 moment of the failure.
    pub occurred_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

/// Status payload of `btps_response` / `btps_error` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStatus {
    pub ok: bool,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A schema-validated document, tagged by its envelope `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactDocument {
    TrustRequest(TrustRequestDoc),
    TrustResponse(TrustResponseDoc),
    Invoice(InvoiceDoc),
    AuthRequest(AuthRequestDoc),
    AuthResponse(AuthResponseDoc),
    Query(QueryDoc),
    DeliveryFailure(DeliveryFailureDoc),
    Response(ResponseStatus),
    Error(ResponseStatus),
}

impl ArtifactDocument {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactDocument::TrustRequest(_) => ArtifactKind::TrustRequest,
            ArtifactDocument::TrustResponse(_) => ArtifactKind::TrustResponse,
            ArtifactDocument::Invoice(_) => ArtifactKind::Invoice,
            ArtifactDocument::AuthRequest(_) => ArtifactKind::AuthRequest,
            ArtifactDocument::AuthResponse(_) => ArtifactKind::AuthResponse,
            ArtifactDocument::Query(_) => ArtifactKind::Query,
            ArtifactDocument::DeliveryFailure(_) => ArtifactKind::DeliveryFailure,
            ArtifactDocument::Response(_) => ArtifactKind::Response,
            ArtifactDocument::Error(_) => ArtifactKind::Error,
        }
    }
}
