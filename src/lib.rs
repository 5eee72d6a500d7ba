//! # btps-sdk
//!
//! Client SDK for BTPS, the Bilateral Trust Protocol (Secure): an
//! inter-domain messaging protocol for structured business artifacts in the
//! spirit of SMTP+DKIM. Identities take the form `account$domain`; a domain
//! publishes its receiving host and signing keys as DNS TXT records under
//! the `_btps` namespace, and peers exchange individually signed,
//! optionally end-to-end encrypted, newline-delimited JSON envelopes over
//! TLS.
//!
//! The crate covers the bilateral wire subsystem:
//!
//! - [`client`] — the connector: DNS resolution, TLS dialing, retry and
//!   backpressure handling, and a typed event stream.
//! - [`crypto`] — canonical serialization, RSA signatures, and the hybrid
//!   RSA+AES document cipher.
//! - [`trust`] — the persistent trust store with concurrent-safe atomic
//!   file persistence.
//! - [`artifact`] / [`codec`] — the canonical wire forms, their validation,
//!   and the sign/encrypt ↔ verify/decrypt composition.
//!
//! ```no_run
//! use btps_sdk::{ArtifactKind, BtpsArtifact, BtpsClient, BtpsClientOptions, Identity};
//! use serde_json::json;
//!
//! # async fn example(identity_key: String, identity_cert: String) -> btps_sdk::Result<()> {
//! let options = BtpsClientOptions::new("billing$a.example", identity_key, identity_cert);
//! let mut client = BtpsClient::new(options)?;
//!
//! let mut events = client.connect("pay$b.example");
//! client.send(BtpsArtifact::new(
//!     Identity::parse("pay$b.example")?,
//!     ArtifactKind::TrustRequest,
//!     json!({
//!         "name": "A Example Billing",
//!         "email": "billing@a.example",
//!         "reason": "Invoice delivery",
//!     }),
//! ))?;
//!
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod client;
pub mod codec;
pub mod crypto;
pub mod errors;
pub mod identity;
pub mod trust;

pub use artifact::{ArtifactDocument, ArtifactKind, BtpsEnvelope, PROTOCOL_VERSION};
pub use client::events::{BtpsEvent, EventStream};
pub use client::retry::{RetryInfo, RetryPolicy};
pub use client::tls::TlsSettings;
pub use client::{BtpsClient, BtpsClientOptions, ConnectionState};
pub use codec::{BtpsArtifact, LineReader};
pub use crypto::cipher::EncryptionMode;
pub use errors::{BtpsError, Result};
pub use identity::resolver::{DnsTxtResolver, SystemDnsResolver, DEFAULT_PORT};
pub use identity::Identity;
pub use trust::file_store::{FileTrustStore, FileTrustStoreOptions};
pub use trust::{TrustRecord, TrustStatus, TrustStore};
