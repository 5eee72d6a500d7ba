//! The BTPS client connector: a TLS-dialing, DNS-resolving, retrying,
//! backpressure-aware transport that signs (and optionally encrypts)
//! outgoing artifacts and reports everything through a typed event stream.

pub mod events;
pub mod queue;
pub mod retry;
pub mod tls;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::artifact::{ArtifactDocument, BtpsEnvelope};
use crate::client::events::{BtpsEvent, EventEmitter, EventStream};
use crate::client::queue::SendQueue;
use crate::client::retry::RetryPolicy;
use crate::client::tls::{Dialer, TlsDialer, TlsSettings, WireStream};
use crate::codec::{
    encode_line, sign_encrypt, verify_decrypt, ArtifactSigner, BtpsArtifact, LineReader,
    DEFAULT_MAX_LINE_BYTES,
};
use crate::crypto::cipher::EncryptionMode;
use crate::errors::{BtpsError, Result};
use crate::identity::resolver::{
    address_parts, resolve_host, DnsTxtResolver, SystemDnsResolver, DEFAULT_PORT,
};
use crate::identity::Identity;

/// Default DNS selector a sender signs under.
pub const DEFAULT_SELECTOR: &str = "btps1";

const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5000;
const READ_CHUNK_BYTES: usize = 8192;

/// Connector configuration. `new` takes the required fields; everything
/// else has a default and is plain data to override.
#[derive(Clone)]
pub struct BtpsClientOptions {
    /// Sender identity in `account$domain` form.
    pub identity: String,
    /// Sender private key, PEM.
    pub identity_key: String,
    /// Sender public key certificate, PEM.
    pub identity_cert: String,
    /// DNS selector the key pair is published under.
    pub selector: String,
    /// Override DNS resolution with a fixed `host[:port]`.
    pub host: Option<String>,
    /// Port override, combined with `host`.
    pub port: Option<u16>,
    pub max_retries: u32,
    /// Base backoff delay; doubles per performed retry.
    pub retry_delay_ms: u64,
    pub connection_timeout_ms: u64,
    pub max_line_bytes: usize,
    pub tls: TlsSettings,
}

impl BtpsClientOptions {
    pub fn new(
        identity: impl Into<String>,
        identity_key: impl Into<String>,
        identity_cert: impl Into<String>,
    ) -> Self {
        let default_policy = RetryPolicy::default();
        Self {
            identity: identity.into(),
            identity_key: identity_key.into(),
            identity_cert: identity_cert.into(),
            selector: DEFAULT_SELECTOR.to_string(),
            host: None,
            port: None,
            max_retries: default_policy.max_retries,
            retry_delay_ms: default_policy.base_delay_ms,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            tls: TlsSettings::default(),
        }
    }
}

/// Observable connection lifecycle. `Destroyed` is a terminal sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connecting,
    Ready,
    Sending,
    AwaitingResponse,
    Closing,
    Closed,
    Destroyed,
}

enum Command {
    Send {
        artifact: BtpsArtifact,
        mode: EncryptionMode,
    },
    End,
}

struct Shared {
    signer: ArtifactSigner,
    resolver: Arc<dyn DnsTxtResolver>,
    dialer: Arc<dyn Dialer>,
    options: BtpsClientOptions,
    policy: RetryPolicy,
    state: Mutex<ConnectionState>,
    destroyed: AtomicBool,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "connection state changed");
            *state = next;
        }
    }
}

/// One logical connection to a recipient domain.
///
/// `connect` spawns the driver task and hands back the event stream;
/// `send`/`end`/`destroy` talk to the driver. The instance owns at most one
/// socket and one retry timer at a time.
pub struct BtpsClient {
    shared: Arc<Shared>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
    driver: Option<AbortHandle>,
}

impl BtpsClient {
    /// Build a client over the system resolver and the rustls dialer.
    pub fn new(options: BtpsClientOptions) -> Result<Self> {
        Self::with_transport(
            options,
            Arc::new(SystemDnsResolver::new()),
            Arc::new(TlsDialer),
        )
    }

    /// Build a client with explicit resolver and dialer implementations.
    pub fn with_transport(
        options: BtpsClientOptions,
        resolver: Arc<dyn DnsTxtResolver>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let identity = Identity::parse(&options.identity)?;
        let signer = ArtifactSigner::new(
            identity,
            options.selector.clone(),
            &options.identity_key,
            &options.identity_cert,
        )?;
        let policy = RetryPolicy {
            max_retries: options.max_retries,
            base_delay_ms: options.retry_delay_ms,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                signer,
                resolver,
                dialer,
                options,
                policy,
                state: Mutex::new(ConnectionState::Idle),
                destroyed: AtomicBool::new(false),
            }),
            cmd_tx: None,
            driver: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Dial `recipient` and return the event stream for this connection.
    ///
    /// A malformed recipient produces a single terminal error on the stream
    /// without any DNS or TLS work. Calling after `destroy` is a no-op that
    /// returns an already-closed stream.
    pub fn connect(&mut self, recipient: &str) -> EventStream {
        let (emitter, stream) = EventEmitter::channel();

        if self.shared.destroyed.load(Ordering::SeqCst) {
            return stream;
        }

        let recipient = match Identity::parse(recipient) {
            Ok(identity) => identity,
            Err(error) => {
                let info = self.shared.policy.info(0, true, false, Some(&error));
                self.shared.set_state(ConnectionState::Closed);
                emitter.emit(BtpsEvent::Error { error, retry: info });
                emitter.emit(BtpsEvent::End { retry: info });
                emitter.emit(BtpsEvent::Closed);
                return stream;
            }
        };

        // One socket per instance: a previous driver is torn down first.
        if let Some(previous) = self.driver.take() {
            previous.abort();
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(drive(shared, recipient, cmd_rx, emitter));
        self.driver = Some(handle.abort_handle());
        self.cmd_tx = Some(cmd_tx);
        stream
    }

    /// Queue an unencrypted signed artifact for delivery.
    pub fn send(&self, artifact: BtpsArtifact) -> Result<()> {
        self.send_encrypted(artifact, EncryptionMode::None)
    }

    /// Queue an artifact for delivery under the given encryption mode.
    pub fn send_encrypted(&self, artifact: BtpsArtifact, mode: EncryptionMode) -> Result<()> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(BtpsError::Destroyed);
        }
        let tx = self.cmd_tx.as_ref().ok_or(BtpsError::NotConnected)?;
        tx.send(Command::Send { artifact, mode })
            .map_err(|_| BtpsError::NotConnected)
    }

    /// Graceful shutdown: flush the queue, close the socket, emit `End`
    /// and `Closed`.
    pub fn end(&self) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Command::End);
        }
    }

    /// Immediate teardown: cancel timers, drop the socket and queue, and
    /// guarantee no further events. Idempotent.
    pub fn destroy(&mut self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.cmd_tx = None;
        self.shared.set_state(ConnectionState::Destroyed);
    }
}

impl Drop for BtpsClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Connection driver: runs the resolve → dial → session pipeline, retrying
/// transient failures per the policy until the budget runs out or the
/// session ends.
async fn drive(
    shared: Arc<Shared>,
    recipient: Identity,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    emitter: EventEmitter,
) {
    let policy = shared.policy;
    let mut retries: u32 = 0;

    loop {
        let stream = match establish(&shared, &recipient).await {
            Ok(stream) => stream,
            Err(error) => {
                let info = policy.info(retries, true, false, Some(&error));
                tracing::warn!(error = %error, will_retry = info.will_retry, "connect failed");
                emitter.emit(BtpsEvent::Error { error, retry: info });
                if info.will_retry {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(info.next_delay_ms)).await;
                    continue;
                }
                shared.set_state(ConnectionState::Closed);
                emitter.emit(BtpsEvent::End { retry: info });
                break;
            }
        };

        shared.set_state(ConnectionState::Ready);
        emitter.emit(BtpsEvent::Connected);
        retries = 0;

        match session(&shared, stream, &mut cmd_rx, &emitter).await {
            SessionEnd::Graceful => {
                let info = policy.info(retries, false, false, None);
                shared.set_state(ConnectionState::Closed);
                emitter.emit(BtpsEvent::End { retry: info });
                break;
            }
            SessionEnd::Fatal(error) => {
                let info = policy.info(retries, true, false, Some(&error));
                emitter.emit(BtpsEvent::Error { error, retry: info });
                shared.set_state(ConnectionState::Closed);
                emitter.emit(BtpsEvent::End { retry: info });
                break;
            }
            SessionEnd::Transient(error) => {
                let info = policy.info(retries, true, false, Some(&error));
                tracing::warn!(error = %error, will_retry = info.will_retry, "session lost");
                emitter.emit(BtpsEvent::Error { error, retry: info });
                if info.will_retry {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(info.next_delay_ms)).await;
                    continue;
                }
                shared.set_state(ConnectionState::Closed);
                emitter.emit(BtpsEvent::End { retry: info });
                break;
            }
        }
    }

    emitter.emit(BtpsEvent::Closed);
}

/// Resolve the target and dial it inside the configured timeout.
async fn establish(shared: &Shared, recipient: &Identity) -> Result<Box<dyn WireStream>> {
    shared.set_state(ConnectionState::Resolving);
    let (host, port) = resolve_target(shared, recipient).await?;

    shared.set_state(ConnectionState::Connecting);
    let timeout_ms = shared.options.connection_timeout_ms;
    match timeout(
        Duration::from_millis(timeout_ms),
        shared.dialer.dial(&host, port, &shared.options.tls),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(BtpsError::ConnectionTimeout(timeout_ms)),
    }
}

async fn resolve_target(shared: &Shared, recipient: &Identity) -> Result<(String, u16)> {
    if let Some(host) = &shared.options.host {
        let url = address_parts(host)?;
        let host = url.host_str().unwrap_or_default().to_string();
        let port = shared.options.port.or(url.port()).unwrap_or(DEFAULT_PORT);
        return Ok((host, port));
    }

    let record = resolve_host(shared.resolver.as_ref(), recipient.domain()).await?;
    let url = address_parts(&record.host)?;
    Ok((
        url.host_str().unwrap_or_default().to_string(),
        url.port().unwrap_or(DEFAULT_PORT),
    ))
}

enum SessionEnd {
    /// Local `end()` or remote close; not retried.
    Graceful,
    /// Wire desynchronized (unparseable or oversize line); not retried.
    Fatal(BtpsError),
    /// Socket-level failure; the policy decides on a reconnect.
    Transient(BtpsError),
}

/// Pump one established connection: outbound commands through the send
/// queue, inbound bytes through the line reader and codec.
async fn session(
    shared: &Shared,
    stream: Box<dyn WireStream>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    emitter: &EventEmitter,
) -> SessionEnd {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut lines = LineReader::new(shared.options.max_line_bytes);
    let mut queue = SendQueue::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Send { artifact, mode }) => {
                    if let Some(end) =
                        outbound(shared, artifact, mode, &mut queue, &mut writer, emitter).await
                    {
                        return end;
                    }
                }
                Some(Command::End) | None => {
                    shared.set_state(ConnectionState::Closing);
                    if let Err(err) = queue.drain(&mut writer).await {
                        tracing::debug!(?err, "flush on close failed");
                    }
                    let _ = writer.shutdown().await;
                    return SessionEnd::Graceful;
                }
            },
            read = reader.read(&mut buf) => match read {
                // Remote end of stream.
                Ok(0) => {
                    shared.set_state(ConnectionState::Closing);
                    return SessionEnd::Graceful;
                }
                Ok(n) => {
                    let complete = match lines.push(&buf[..n]) {
                        Ok(complete) => complete,
                        Err(err) => return SessionEnd::Fatal(err),
                    };
                    for line in complete {
                        match inbound(shared, &line).await {
                            Ok((envelope, document)) => {
                                emitter.emit(BtpsEvent::Message { envelope, document });
                            }
                            Err(error @ BtpsError::Syntax(_)) => {
                                return SessionEnd::Fatal(error);
                            }
                            // Verification, decryption and schema failures
                            // poison the artifact, not the connection.
                            Err(error) => {
                                let info = shared.policy.info(0, false, false, Some(&error));
                                emitter.emit(BtpsEvent::Error { error, retry: info });
                            }
                        }
                    }
                }
                Err(err) => return SessionEnd::Transient(err.into()),
            },
        }
    }
}

/// Sign, encrypt, enqueue and drain one outbound artifact. Returns a
/// session end only for transport failures.
async fn outbound(
    shared: &Shared,
    artifact: BtpsArtifact,
    mode: EncryptionMode,
    queue: &mut SendQueue,
    writer: &mut WriteHalf<Box<dyn WireStream>>,
    emitter: &EventEmitter,
) -> Option<SessionEnd> {
    shared.set_state(ConnectionState::Sending);

    let envelope = match sign_encrypt(artifact, &shared.signer, shared.resolver.as_ref(), &mode)
        .await
        .and_then(|envelope| Ok((encode_line(&envelope)?, envelope)))
    {
        Ok((line, envelope)) => {
            queue.push(envelope.id.clone(), line);
            envelope
        }
        Err(error) => {
            // The artifact never made it onto the wire; the connection is
            // still good.
            let info = shared.policy.info(0, false, false, Some(&error));
            emitter.emit(BtpsEvent::Error { error, retry: info });
            shared.set_state(ConnectionState::Ready);
            return None;
        }
    };
    tracing::debug!(id = %envelope.id, kind = %envelope.kind, "artifact queued");

    match queue.drain(writer).await {
        Ok(sent) => {
            for id in sent {
                emitter.emit(BtpsEvent::MessageSent { id });
            }
            shared.set_state(ConnectionState::AwaitingResponse);
            None
        }
        Err(err) => Some(SessionEnd::Transient(err.into())),
    }
}

/// Parse, verify and (when encrypted) decrypt one inbound line.
async fn inbound(shared: &Shared, line: &str) -> Result<(BtpsEnvelope, ArtifactDocument)> {
    let envelope: BtpsEnvelope = serde_json::from_str(line)?;
    let document = verify_decrypt(
        &envelope,
        Some(shared.signer.identity()),
        Some(shared.signer.private_key()),
        None,
        shared.resolver.as_ref(),
    )
    .await?;
    Ok((envelope, document))
}
