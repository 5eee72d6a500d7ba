//! Total validation of envelopes and their typed documents.
//!
//! Every check either passes or produces a [`BtpsError::SchemaValidation`]
//! naming the offending field path. Validation runs at two points: before
//! signing on the way out, and after decryption (or after verification when
//! nothing was encrypted) on the way in.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::artifact::{
    ArtifactDocument, ArtifactKind, AuthRequestDoc, AuthResponseDoc, BtpsEnvelope,
    DeliveryFailureDoc, InvoiceDoc, QueryDoc, ResponseStatus, TrustRequestDoc, TrustResponseDoc,
};
use crate::errors::{BtpsError, Result};

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("valid regex"))
}

fn invalid(path: &str, message: impl Into<String>) -> BtpsError {
    BtpsError::SchemaValidation {
        path: path.to_string(),
        message: message.into(),
    }
}

fn require_non_empty(path: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(path, "must be a non-empty string"));
    }
    Ok(())
}

fn require_rfc3339(path: &str, value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid(path, format!("not an RFC 3339 timestamp: {err}")))
}

fn require_rfc3339_opt(path: &str, value: &Option<String>) -> Result<Option<DateTime<FixedOffset>>> {
    value
        .as_deref()
        .map(|raw| require_rfc3339(path, raw))
        .transpose()
}

/// Cross-field envelope invariants, checkable whether or not the document
/// is still ciphertext.
pub fn check_envelope_shape(envelope: &BtpsEnvelope) -> Result<()> {
    if !version_re().is_match(&envelope.version) {
        return Err(invalid("version", "must match MAJOR.MINOR.PATCH"));
    }
    require_non_empty("id", &envelope.id)?;
    require_rfc3339("issuedAt", &envelope.issued_at)?;

    if envelope.encryption.is_some() && !envelope.document.is_string() {
        return Err(invalid(
            "document",
            "must be a ciphertext string when encryption is present",
        ));
    }

    match (&envelope.signature, &envelope.signed_by, &envelope.selector) {
        (Some(_), Some(_), Some(selector)) => require_non_empty("selector", selector)?,
        (Some(_), _, _) => {
            return Err(invalid(
                "signedBy",
                "signedBy and selector are required alongside signature",
            ));
        }
        (None, None, None) => {}
        (None, _, _) => {
            return Err(invalid(
                "signature",
                "signedBy/selector present without a signature",
            ));
        }
    }

    Ok(())
}

/// Decode and validate the typed document for `kind`.
///
/// Must only be called on plaintext documents; encrypted envelopes are
/// decrypted first.
pub fn decode_document(kind: ArtifactKind, document: &Value) -> Result<ArtifactDocument> {
    match kind {
        ArtifactKind::TrustRequest => {
            let doc: TrustRequestDoc = decode(document)?;
            require_non_empty("document.name", &doc.name)?;
            require_non_empty("document.email", &doc.email)?;
            if !doc.email.contains('@') {
                return Err(invalid("document.email", "not an email address"));
            }
            require_non_empty("document.reason", &doc.reason)?;
            Ok(ArtifactDocument::TrustRequest(doc))
        }
        ArtifactKind::TrustResponse => {
            let doc: TrustResponseDoc = decode(document)?;
            let decided = require_rfc3339("document.decidedAt", &doc.decided_at)?;
            if let Some(expires) = require_rfc3339_opt("document.expiresAt", &doc.expires_at)? {
                if expires <= decided {
                    return Err(invalid("document.expiresAt", "must be after decidedAt"));
                }
            }
            Ok(ArtifactDocument::TrustResponse(doc))
        }
        ArtifactKind::Invoice => {
            let doc: InvoiceDoc = decode(document)?;
            require_non_empty("document.documentId", &doc.document_id)?;
            require_non_empty("document.currency", &doc.currency)?;
            if !doc.total_amount.is_finite() || doc.total_amount < 0.0 {
                return Err(invalid("document.totalAmount", "must be a non-negative amount"));
            }
            if doc.line_items.is_empty() {
                return Err(invalid("document.lineItems", "must not be empty"));
            }
            for (index, item) in doc.line_items.iter().enumerate() {
                let path = format!("document.lineItems[{index}]");
                require_non_empty(&format!("{path}.description"), &item.description)?;
                if !item.amount.is_finite() {
                    return Err(invalid(&format!("{path}.amount"), "must be a finite amount"));
                }
            }
            require_rfc3339_opt("document.dueDate", &doc.due_date)?;
            Ok(ArtifactDocument::Invoice(doc))
        }
        ArtifactKind::AuthRequest => {
            let doc: AuthRequestDoc = decode(document)?;
            require_non_empty("document.agentId", &doc.agent_id)?;
            Ok(ArtifactDocument::AuthRequest(doc))
        }
        ArtifactKind::AuthResponse => {
            let doc: AuthResponseDoc = decode(document)?;
            if doc.granted && doc.token.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(invalid("document.token", "required when granted"));
            }
            require_rfc3339_opt("document.expiresAt", &doc.expires_at)?;
            Ok(ArtifactDocument::AuthResponse(doc))
        }
        ArtifactKind::Query => {
            let doc: QueryDoc = decode(document)?;
            require_rfc3339_opt("document.since", &doc.since)?;
            require_rfc3339_opt("document.until", &doc.until)?;
            if doc.limit == Some(0) {
                return Err(invalid("document.limit", "must be at least 1"));
            }
            Ok(ArtifactDocument::Query(doc))
        }
        ArtifactKind::DeliveryFailure => {
            let doc: DeliveryFailureDoc = decode(document)?;
            require_non_empty("document.reason", &doc.reason)?;
            require_non_empty("document.failedArtifactId", &doc.failed_artifact_id)?;
            require_rfc3339("document.occurredAt", &doc.occurred_at)?;
            Ok(ArtifactDocument::DeliveryFailure(doc))
        }
        ArtifactKind::Response => Ok(ArtifactDocument::Response(decode_status(document)?)),
        ArtifactKind::Error => Ok(ArtifactDocument::Error(decode_status(document)?)),
    }
}

/// Shape check plus typed decode, for plaintext envelopes.
pub fn validate_envelope(envelope: &BtpsEnvelope) -> Result<ArtifactDocument> {
    check_envelope_shape(envelope)?;
    if envelope.encryption.is_some() {
        return Err(invalid("document", "cannot validate an encrypted document"));
    }
    decode_document(envelope.kind, &envelope.document)
}

fn decode<T: DeserializeOwned>(document: &Value) -> Result<T> {
    serde_json::from_value(document.clone())
        .map_err(|err| invalid("document", err.to_string()))
}

fn decode_status(document: &Value) -> Result<ResponseStatus> {
    decode(document)
}
