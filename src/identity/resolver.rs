use std::collections::HashMap;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use url::Url;

use crate::artifact::PROTOCOL_VERSION;
use crate::errors::{BtpsError, Result};
use crate::identity::Identity;

/// Reserved DNS namespace under which BTPS records are published.
pub const DNS_NAMESPACE: &str = "_btps";

/// Default wire port when the published host carries no `:port`.
pub const DEFAULT_PORT: u16 = 3443;

/// URL scheme accepted in peer-supplied addresses.
pub const BTPS_SCHEME: &str = "btps";

/// TXT lookup seam so the discovery logic can run against the real resolver
/// or an in-memory view in tests.
#[async_trait]
pub trait DnsTxtResolver: Send + Sync {
    /// Return the character strings of every TXT record at `name`, one entry
    /// per record, each record's strings concatenated.
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>>;
}

/// System resolver backed by hickory-dns on the tokio runtime.
pub struct SystemDnsResolver {
    inner: TokioAsyncResolver,
}

impl SystemDnsResolver {
    /// Resolver from the host's `/etc/resolv.conf`, falling back to the
    /// default public configuration when the system one is unreadable.
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            tracing::warn!(?err, "system resolver config unavailable, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }
}

impl Default for SystemDnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsTxtResolver for SystemDnsResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>> {
        let lookup = self
            .inner
            .txt_lookup(name)
            .await
            .map_err(|err| BtpsError::DnsResolutionFailed(err.to_string()))?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<String>()
            })
            .collect())
    }
}

/// Host and active selector published by a receiving domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    /// `host` or `host:port` accepting BTPS traffic for the domain.
    pub host: String,
    /// Selector naming the domain's currently active signing key.
    pub selector: String,
}

/// Which field of a published key record to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
    /// The `k` key-type field.
    Key,
    /// The `p` field, decoded into a PEM public key.
    Pem,
    /// The `v` version field.
    Version,
}

/// Resolve the `_btps.<domain>` TXT record into a [`HostRecord`].
///
/// DNS-level failures are transient; a record that answers but lacks the
/// required fields is a terminal configuration error.
pub async fn resolve_host(resolver: &dyn DnsTxtResolver, domain: &str) -> Result<HostRecord> {
    let name = format!("{DNS_NAMESPACE}.{domain}.");
    let records = resolver.txt_lookup(&name).await?;
    let pairs = parse_txt_pairs(&records);

    if pairs.get("v").map(String::as_str) != Some(PROTOCOL_VERSION) {
        return Err(BtpsError::MissingDnsConfig(format!(
            "{name} does not publish v={PROTOCOL_VERSION}"
        )));
    }

    match (pairs.get("u"), pairs.get("s")) {
        (Some(host), Some(selector)) if !host.is_empty() && !selector.is_empty() => {
            Ok(HostRecord {
                host: host.clone(),
                selector: selector.clone(),
            })
        }
        _ => Err(BtpsError::MissingDnsConfig(format!(
            "{name} is missing the u= or s= field"
        ))),
    }
}

/// Resolve one part of the key record published at
/// `<selector>._btps.<account>.<domain>`.
pub async fn resolve_key(
    resolver: &dyn DnsTxtResolver,
    identity: &Identity,
    selector: &str,
    part: KeyPart,
) -> Result<String> {
    let name = format!(
        "{selector}.{DNS_NAMESPACE}.{}.{}.",
        identity.account(),
        identity.domain()
    );
    let records = resolver.txt_lookup(&name).await?;
    let pairs = parse_txt_pairs(&records);

    if pairs.get("v").map(String::as_str) != Some(PROTOCOL_VERSION) {
        return Err(BtpsError::MissingDnsConfig(format!(
            "{name} does not publish v={PROTOCOL_VERSION}"
        )));
    }

    let field = match part {
        KeyPart::Key => "k",
        KeyPart::Pem => "p",
        KeyPart::Version => "v",
    };
    let value = pairs
        .get(field)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            BtpsError::MissingDnsConfig(format!("{name} is missing the {field}= field"))
        })?;

    Ok(match part {
        KeyPart::Pem => pem_from_base64_body(value),
        _ => value.clone(),
    })
}

/// Concatenate all TXT strings, split on `;`, trim, split each pair on the
/// first `=`. Later duplicates win, matching last-record-read semantics.
fn parse_txt_pairs(records: &[String]) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    let joined = records.join(";");
    for entry in joined.split(';') {
        if let Some((key, value)) = entry.split_once('=') {
            pairs.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    pairs
}

/// Re-wrap a headerless base64 SPKI body into PEM form.
fn pem_from_base64_body(body: &str) -> String {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for chunk in compact.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    pem
}

/// Normalize a peer-supplied `host[:port]` or `btps://host[:port]` address.
///
/// The default port is [`DEFAULT_PORT`]. Any scheme other than `btps` is a
/// terminal [`BtpsError::UnsupportedProtocol`].
pub fn address_parts(input: &str) -> Result<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(BtpsError::InvalidHostname("empty address".into()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{BTPS_SCHEME}://{trimmed}")
    };

    let mut url = Url::parse(&candidate)
        .map_err(|err| BtpsError::InvalidHostname(format!("{trimmed}: {err}")))?;

    if url.scheme() != BTPS_SCHEME {
        return Err(BtpsError::UnsupportedProtocol(url.scheme().to_string()));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(BtpsError::InvalidHostname(format!("{trimmed}: missing host")));
    }
    if url.port().is_none() {
        url.set_port(Some(DEFAULT_PORT))
            .map_err(|_| BtpsError::InvalidHostname(trimmed.to_string()))?;
    }

    Ok(url)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use parking_lot::RwLock;

    /// In-memory TXT zone for tests.
    #[derive(Default)]
    pub(crate) struct StaticDnsResolver {
        zone: RwLock<HashMap<String, Vec<String>>>,
    }

    impl StaticDnsResolver {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn publish(&self, name: &str, records: Vec<String>) {
            self.zone.write().insert(name.to_string(), records);
        }
    }

    #[async_trait]
    impl DnsTxtResolver for StaticDnsResolver {
        async fn txt_lookup(&self, name: &str) -> Result<Vec<String>> {
            self.zone
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| BtpsError::DnsResolutionFailed(format!("no TXT at {name}")))
        }
    }

    #[tokio::test]
    async fn resolves_host_and_selector() {
        let dns = StaticDnsResolver::new();
        dns.publish(
            "_btps.example.com.",
            vec!["v=1.0.0; u=btps.example.com:3443; s=btps1".to_string()],
        );

        let record = resolve_host(&dns, "example.com").await.unwrap();
        assert_eq!(record.host, "btps.example.com:3443");
        assert_eq!(record.selector, "btps1");
    }

    #[tokio::test]
    async fn host_record_strings_concatenate_across_sets() {
        let dns = StaticDnsResolver::new();
        dns.publish(
            "_btps.example.com.",
            vec!["v=1.0.0; u=mx.example.com".to_string(), "s=k2".to_string()],
        );

        let record = resolve_host(&dns, "example.com").await.unwrap();
        assert_eq!(record.host, "mx.example.com");
        assert_eq!(record.selector, "k2");
    }

    #[tokio::test]
    async fn missing_fields_are_terminal() {
        let dns = StaticDnsResolver::new();
        dns.publish("_btps.example.com.", vec!["v=1.0.0; u=mx.example.com".to_string()]);

        let err = resolve_host(&dns, "example.com").await.unwrap_err();
        assert!(matches!(err, BtpsError::MissingDnsConfig(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn dns_failure_is_transient() {
        let dns = StaticDnsResolver::new();
        let err = resolve_host(&dns, "nxdomain.example").await.unwrap_err();
        assert!(matches!(err, BtpsError::DnsResolutionFailed(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn version_mismatch_is_terminal() {
        let dns = StaticDnsResolver::new();
        dns.publish(
            "_btps.example.com.",
            vec!["v=2.0.0; u=mx.example.com; s=btps1".to_string()],
        );

        let err = resolve_host(&dns, "example.com").await.unwrap_err();
        assert!(matches!(err, BtpsError::MissingDnsConfig(_)));
    }

    #[tokio::test]
    async fn resolves_key_pem() {
        let dns = StaticDnsResolver::new();
        let identity = Identity::parse("alice$example.com").unwrap();
        dns.publish(
            "btps1._btps.alice.example.com.",
            vec!["v=1.0.0; k=rsa; p=AAAABBBBCCCC".to_string()],
        );

        let pem = resolve_key(&dns, &identity, "btps1", KeyPart::Pem)
            .await
            .unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.contains("AAAABBBBCCCC"));
        assert!(pem.ends_with("-----END PUBLIC KEY-----\n"));

        let kind = resolve_key(&dns, &identity, "btps1", KeyPart::Key)
            .await
            .unwrap();
        assert_eq!(kind, "rsa");
    }

    #[test]
    fn address_parts_normalizes() {
        let url = address_parts("btps.example.com").unwrap();
        assert_eq!(url.host_str(), Some("btps.example.com"));
        assert_eq!(url.port(), Some(DEFAULT_PORT));

        let url = address_parts("btps://btps.example.com:9000").unwrap();
        assert_eq!(url.port(), Some(9000));

        let url = address_parts("10.0.0.5:3500").unwrap();
        assert_eq!(url.host_str(), Some("10.0.0.5"));
        assert_eq!(url.port(), Some(3500));
    }

    #[test]
    fn address_parts_rejects_foreign_schemes() {
        let err = address_parts("https://example.com").unwrap_err();
        assert!(matches!(err, BtpsError::UnsupportedProtocol(_)));

        let err = address_parts("").unwrap_err();
        assert!(matches!(err, BtpsError::InvalidHostname(_)));
    }
}
