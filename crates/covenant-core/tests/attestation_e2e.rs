//! End-to-end attestation exchanges over an in-memory duplex transport.
//!
//! Both sides run inside the test process, so the initiator's self digest
//! and the responder's expected digest can be made to agree (or not) by
//! construction.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use covenant_core::digest::CodeDigest;
use covenant_core::engine::{AttestationContext, Initiator, Responder, Transport, ValidationOutcome};
use covenant_core::error::{ConfigError, TransportError};
use covenant_core::expected::ExpectedDigest;
use covenant_core::hasher::CodeHasher;
use covenant_core::keystore::{KeyProvider, SoftwareKeyProvider, PublicKeyBytes};
use covenant_core::registry::IdentityRegistry;
use covenant_core::role::Role;
use tokio::sync::mpsc;

/// Initiator end of a duplex in-memory channel.
struct DuplexTransport {
    to_responder: mpsc::Sender<Vec<u8>>,
    from_responder: mpsc::Receiver<Vec<u8>>,
    /// Copies of observed response frames, for replay scenarios.
    tap: Option<Arc<Mutex<Vec<Vec<u8>>>>>,
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.to_responder
            .send(frame)
            .await
            .map_err(|_| TransportError::unreachable("responder channel closed"))
    }

    async fn await_response(&mut self, deadline: Duration) -> Option<Vec<u8>> {
        let frame = tokio::time::timeout(deadline, self.from_responder.recv())
            .await
            .ok()
            .flatten()?;
        if let Some(tap) = &self.tap {
            tap.lock().unwrap().push(frame.clone());
        }
        Some(frame)
    }
}

struct Harness {
    initiator_ctx: Arc<AttestationContext>,
    responder_ctx: Arc<AttestationContext>,
    initiator_registry: Arc<IdentityRegistry>,
    responder_registry: Arc<IdentityRegistry>,
    responder_provider: Arc<SoftwareKeyProvider>,
}

impl Harness {
    fn new() -> Self {
        let initiator_registry = Arc::new(IdentityRegistry::in_memory().unwrap());
        let responder_registry = Arc::new(IdentityRegistry::in_memory().unwrap());
        let responder_provider = Arc::new(SoftwareKeyProvider::in_memory());

        let initiator_ctx = Arc::new(AttestationContext::new(
            Role::Initiator,
            Arc::new(SoftwareKeyProvider::in_memory()),
            initiator_registry.clone(),
            CodeHasher::new(),
        ));
        let responder_ctx = Arc::new(AttestationContext::new(
            Role::Responder,
            responder_provider.clone(),
            responder_registry.clone(),
            CodeHasher::new(),
        ));

        Self {
            initiator_ctx,
            responder_ctx,
            initiator_registry,
            responder_registry,
            responder_provider,
        }
    }

    /// The digest both sides genuinely have in this test process.
    fn true_self_digest() -> CodeDigest {
        CodeHasher::new().compute_self_digest().unwrap()
    }

    /// Spawn a responder task serving a single exchange, and return the
    /// initiator's transport end.
    fn serve(&self, expected: ExpectedDigest, tap: Option<Arc<Mutex<Vec<Vec<u8>>>>>) -> DuplexTransport {
        let (req_tx, mut req_rx) = mpsc::channel::<Vec<u8>>(1);
        let (resp_tx, resp_rx) = mpsc::channel::<Vec<u8>>(1);

        let ctx = self.responder_ctx.clone();
        tokio::spawn(async move {
            let mut responder = Responder::new(ctx, expected);
            if let Some(frame) = req_rx.recv().await {
                if let Ok(reply) = responder.handle_frame(&frame) {
                    let _ = resp_tx.send(reply).await;
                }
            }
        });

        DuplexTransport {
            to_responder: req_tx,
            from_responder: resp_rx,
            tap,
        }
    }
}

#[tokio::test]
async fn fresh_pair_bootstraps_and_validates() {
    let harness = Harness::new();
    let expected = ExpectedDigest::new(Harness::true_self_digest());

    let transport = harness.serve(expected, None);
    let initiator = Initiator::new(harness.initiator_ctx.clone(), transport);
    let outcome = initiator.attest(Duration::from_secs(2)).await;

    assert_eq!(outcome, ValidationOutcome::Valid);

    // Both registries now hold the other side's key.
    let responder_key = harness.responder_provider.public_key("responder").unwrap();
    assert_eq!(
        harness.initiator_registry.peer_key(Role::Responder).unwrap(),
        Some(responder_key)
    );
    assert!(harness
        .responder_registry
        .peer_key(Role::Initiator)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn digest_mismatch_is_tampered_but_responder_still_bootstraps() {
    let harness = Harness::new();
    // The responder expects a digest the initiator cannot produce.
    let expected = ExpectedDigest::new(CodeDigest::of_content(b"some other build"));

    let transport = harness.serve(expected, None);
    let initiator = Initiator::new(harness.initiator_ctx.clone(), transport);
    let outcome = initiator.attest(Duration::from_secs(2)).await;

    assert_eq!(outcome, ValidationOutcome::Tampered);

    // A hash mismatch is not an identity attack: the responder recorded
    // the initiator key. The initiator, rejected, recorded nothing.
    assert!(harness
        .responder_registry
        .peer_key(Role::Initiator)
        .unwrap()
        .is_some());
    assert_eq!(
        harness.initiator_registry.peer_key(Role::Responder).unwrap(),
        None
    );
}

#[tokio::test]
async fn substituted_responder_identity_is_tampered() {
    let harness = Harness::new();
    let expected = ExpectedDigest::new(Harness::true_self_digest());

    // A previous exchange recorded a different responder key.
    let old_key = PublicKeyBytes::from_bytes([0x42u8; 32]);
    harness
        .initiator_registry
        .store_peer_key(Role::Responder, &old_key)
        .unwrap();

    let transport = harness.serve(expected, None);
    let initiator = Initiator::new(harness.initiator_ctx.clone(), transport);
    let outcome = initiator.attest(Duration::from_secs(2)).await;

    assert_eq!(outcome, ValidationOutcome::Tampered);
    // The recorded key is untouched.
    assert_eq!(
        harness.initiator_registry.peer_key(Role::Responder).unwrap(),
        Some(old_key)
    );
}

#[tokio::test]
async fn replayed_response_is_tampered() {
    let harness = Harness::new();
    let expected = ExpectedDigest::new(Harness::true_self_digest());

    // First exchange succeeds; tap the response frame off the wire.
    let tap = Arc::new(Mutex::new(Vec::new()));
    let transport = harness.serve(expected, Some(tap.clone()));
    let initiator = Initiator::new(harness.initiator_ctx.clone(), transport);
    assert_eq!(
        initiator.attest(Duration::from_secs(2)).await,
        ValidationOutcome::Valid
    );

    let captured = tap.lock().unwrap().pop().expect("response frame captured");

    // Replay the captured frame against a fresh exchange. The signature
    // still verifies and the identity still matches, but the echoed nonce
    // belongs to the earlier exchange.
    struct ReplayTransport {
        frame: Option<Vec<u8>>,
    }

    #[async_trait]
    impl Transport for ReplayTransport {
        async fn send(&mut self, _frame: Vec<u8>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn await_response(&mut self, _deadline: Duration) -> Option<Vec<u8>> {
            self.frame.take()
        }
    }

    let initiator = Initiator::new(
        harness.initiator_ctx.clone(),
        ReplayTransport {
            frame: Some(captured),
        },
    );
    let outcome = initiator.attest(Duration::from_secs(2)).await;
    assert_eq!(outcome, ValidationOutcome::Tampered);
}

#[tokio::test(start_paused = true)]
async fn silent_responder_is_timeout_and_registry_untouched() {
    let harness = Harness::new();

    // A transport whose peer never answers.
    struct SilentTransport;

    #[async_trait]
    impl Transport for SilentTransport {
        async fn send(&mut self, _frame: Vec<u8>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn await_response(&mut self, deadline: Duration) -> Option<Vec<u8>> {
            tokio::time::sleep(deadline).await;
            None
        }
    }

    let initiator = Initiator::new(harness.initiator_ctx.clone(), SilentTransport);
    let outcome = initiator.attest(Duration::from_secs(5)).await;

    assert_eq!(outcome, ValidationOutcome::Timeout);
    assert_eq!(
        harness.initiator_registry.peer_key(Role::Responder).unwrap(),
        None
    );
}

#[tokio::test(start_paused = true)]
async fn stale_response_after_deadline_is_discarded() {
    let harness = Harness::new();
    let expected = ExpectedDigest::new(Harness::true_self_digest());

    // The responder works correctly but its reply is delivered too late.
    let (req_tx, mut req_rx) = mpsc::channel::<Vec<u8>>(1);
    let (resp_tx, resp_rx) = mpsc::channel::<Vec<u8>>(1);

    let ctx = harness.responder_ctx.clone();
    tokio::spawn(async move {
        let mut responder = Responder::new(ctx, expected);
        if let Some(frame) = req_rx.recv().await {
            if let Ok(reply) = responder.handle_frame(&frame) {
                tokio::time::sleep(Duration::from_secs(10)).await;
                let _ = resp_tx.send(reply).await;
            }
        }
    });

    let transport = DuplexTransport {
        to_responder: req_tx,
        from_responder: resp_rx,
        tap: None,
    };
    let initiator = Initiator::new(harness.initiator_ctx.clone(), transport);
    let outcome = initiator.attest(Duration::from_secs(2)).await;

    assert_eq!(outcome, ValidationOutcome::Timeout);

    // Let the late reply land; the exchange is over and the registry must
    // not change retroactively.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(
        harness.initiator_registry.peer_key(Role::Responder).unwrap(),
        None
    );
}

#[tokio::test]
async fn unconfigured_transport_reports_error() {
    let harness = Harness::new();

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn send(&mut self, _frame: Vec<u8>) -> Result<(), TransportError> {
            Err(TransportError::not_configured("validator never installed"))
        }

        async fn await_response(&mut self, _deadline: Duration) -> Option<Vec<u8>> {
            None
        }
    }

    let initiator = Initiator::new(harness.initiator_ctx.clone(), NoTransport);
    let outcome = initiator.attest(Duration::from_secs(1)).await;
    assert_eq!(outcome, ValidationOutcome::Error);
}

#[test]
fn responder_startup_fails_without_expected_artifact() {
    let dir = tempfile::tempdir().unwrap();

    let err = ExpectedDigest::load(&dir.path().join("covenant.digest")).unwrap_err();
    assert!(matches!(err, ConfigError::ExpectedDigestMissing { .. }));

    let malformed = dir.path().join("malformed.digest");
    std::fs::write(&malformed, "expected_digest = not-a-digest\n").unwrap();
    let err = ExpectedDigest::load(&malformed).unwrap_err();
    assert!(matches!(err, ConfigError::MalformedArtifact { .. }));
}
