//! Attestation protocol state machines.
//!
//! One [`Initiator`] and one [`Responder`] per exchange; both are one-shot.
//! A new exchange always starts a fresh instance.
//!
//! ```text
//! Initiator: Idle → AwaitingResponse → {Accepted | Rejected | TimedOut | Errored}
//! Responder: Idle → Validating → {RepliedValid | RepliedInvalid}
//! ```
//!
//! # Fail-closed collapse
//!
//! Verification anomalies (bad signature, nonce mismatch, identity
//! substitution, rejected digest) all collapse into
//! [`ValidationOutcome::Tampered`]; a missing response collapses into
//! [`ValidationOutcome::Timeout`]. The detailed [`ProtocolError`] cause is
//! recorded in this process's logs only — handing the distinction to an
//! attacker-observable caller would aid attack refinement. The single
//! exception is a transport that was never configured (validator component
//! absent), reported as [`ValidationOutcome::Error`] because it is a
//! deployment fault the embedder can fix.
//!
//! By integration contract, the embedding application treats any
//! non-`Valid` outcome as compromise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::digest::CodeDigest;
use crate::error::{KeyError, ProtocolError, StoreError, TransportError};
use crate::expected::ExpectedDigest;
use crate::hasher::{CodeHasher, HasherError};
use crate::keystore::{verify, KeyProvider, PublicKeyBytes};
use crate::messages::{
    now_millis, AttestationMessage, AttestationRequest, AttestationResponse, CodecError, Nonce,
};
use crate::registry::IdentityRegistry;
use crate::role::Role;

/// Default exchange deadline.
pub const DEFAULT_ATTESTATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal verdict of one attestation exchange.
///
/// Consumed by the caller, never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The peer proved its code is unmodified.
    Valid,

    /// Verification failed or the peer rejected us. Fail-closed: any
    /// verification anomaly lands here, because a forged, rejected, or
    /// mismatched response is itself evidence of compromise.
    Tampered,

    /// No response before the deadline. Fail-closed by policy.
    Timeout,

    /// Setup fault on our own side (transport not configured, key or
    /// registry failure). Remediable, but still treated as compromise by
    /// the integration contract.
    Error,
}

/// Terminal initiator states; [`Initiator::attest`] owns the live
/// awaiting-response phase internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiatorState {
    Accepted,
    Rejected,
    TimedOut,
    Errored,
}

/// Responder progress across its single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponderState {
    /// No request handled yet.
    #[default]
    Idle,

    /// A request is being validated.
    Validating,

    /// Replied with a positive verdict.
    RepliedValid,

    /// Replied with a negative verdict.
    RepliedInvalid,
}

/// Own-side failures while building a response.
///
/// Verification failures of the *peer's* request never surface here; they
/// produce a signed negative response instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Key provider failure for our own identity.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Our own code digest could not be computed.
    #[error(transparent)]
    Hasher(#[from] HasherError),

    /// Frame encoding/decoding failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The engine already completed its single exchange.
    #[error("exchange already completed; start a fresh engine")]
    ExchangeComplete,
}

/// Explicit, process-wide dependencies of the protocol engines.
///
/// Constructed once at process start and passed into each engine; there is
/// no ambient global state.
pub struct AttestationContext {
    key_provider: Arc<dyn KeyProvider>,
    registry: Arc<IdentityRegistry>,
    hasher: CodeHasher,
    role: Role,
    key_tag: String,
}

impl AttestationContext {
    /// Assemble a context for one side of the exchange.
    ///
    /// The own-identity key tag defaults to the role's string form.
    #[must_use]
    pub fn new(
        role: Role,
        key_provider: Arc<dyn KeyProvider>,
        registry: Arc<IdentityRegistry>,
        hasher: CodeHasher,
    ) -> Self {
        Self {
            key_provider,
            registry,
            hasher,
            role,
            key_tag: role.as_str().to_string(),
        }
    }

    /// Override the own-identity key tag.
    #[must_use]
    pub fn with_key_tag(mut self, tag: impl Into<String>) -> Self {
        self.key_tag = tag.into();
        self
    }

    /// This side's role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The identity registry in use.
    #[must_use]
    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Fetch our public key, creating the identity on first use.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if neither fetching nor generating succeeds.
    pub fn ensure_identity(&self) -> Result<PublicKeyBytes, KeyError> {
        if let Some(key) = self.key_provider.public_key(&self.key_tag) {
            return Ok(key);
        }
        match self.key_provider.generate_key_pair(&self.key_tag) {
            Ok(()) | Err(KeyError::AlreadyExists { .. }) => {},
            Err(e) => return Err(e),
        }
        self.key_provider
            .public_key(&self.key_tag)
            .ok_or_else(|| KeyError::not_found(&self.key_tag))
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.key_provider.sign(&self.key_tag, message)
    }

    fn self_digest(&self) -> Result<CodeDigest, HasherError> {
        self.hasher.compute_self_digest()
    }

    /// Recorded key for the peer's role, if any.
    fn recorded_peer_key(&self) -> Result<Option<PublicKeyBytes>, StoreError> {
        self.registry.peer_key(self.role.peer())
    }
}

/// Opaque bidirectional request/response channel to the peer.
///
/// Supplied by the host environment; delivery failure and timeout are its
/// only observable behaviors. Implementations must discard responses that
/// arrive after the deadline passed to [`Transport::await_response`] —
/// the engine never reads from the channel again once its exchange
/// concluded.
#[async_trait]
pub trait Transport: Send {
    /// Fire-and-forget delivery of a frame to the peer.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConfigured`] when the endpoint was never set
    /// up (reported distinctly); any other failure collapses into the
    /// timeout path.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Suspend until a response frame arrives or `deadline` elapses.
    async fn await_response(&mut self, deadline: Duration) -> Option<Vec<u8>>;
}

/// Initiator-side engine: builds a signed request and judges the response.
pub struct Initiator<T: Transport> {
    ctx: Arc<AttestationContext>,
    transport: T,
}

impl<T: Transport> Initiator<T> {
    /// Create a fresh initiator for a single exchange.
    #[must_use]
    pub fn new(ctx: Arc<AttestationContext>, transport: T) -> Self {
        Self { ctx, transport }
    }

    /// Run one attestation exchange bounded by `timeout`.
    ///
    /// Consumes the engine: the nonce, request, and response live only
    /// within this call, and a stale response can never mutate state
    /// afterwards.
    pub async fn attest(mut self, timeout: Duration) -> ValidationOutcome {
        // Own-side setup: failures here are remediable faults, not
        // verdicts about the peer.
        let own_key = match self.ctx.ensure_identity() {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "cannot establish own identity");
                return ValidationOutcome::Error;
            },
        };
        let digest = match self.ctx.self_digest() {
            Ok(digest) => digest,
            Err(e) => {
                error!(error = %e, "cannot compute own code digest");
                return ValidationOutcome::Error;
            },
        };

        let nonce = Nonce::generate();
        let preimage = AttestationRequest::signing_preimage(&digest, &nonce);
        let signature = match self.ctx.sign(&preimage) {
            Ok(signature) => signature,
            Err(e) => {
                error!(error = %e, "cannot sign attestation request");
                return ValidationOutcome::Error;
            },
        };

        let request = AttestationRequest {
            digest,
            signature: hex::encode(signature),
            public_key: own_key,
            nonce,
            timestamp_ms: now_millis(),
        };
        let frame = match AttestationMessage::from(request).encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "cannot encode attestation request");
                return ValidationOutcome::Error;
            },
        };

        debug!(role = %self.ctx.role(), timeout_ms = timeout.as_millis() as u64, "sending attestation request");
        if let Err(e) = self.transport.send(frame).await {
            return match e {
                TransportError::NotConfigured { .. } => {
                    error!(error = %e, "attestation transport not configured");
                    ValidationOutcome::Error
                },
                other => {
                    warn!(error = %other, "attestation request delivery failed");
                    self.conclude(InitiatorState::TimedOut)
                },
            };
        }

        // Race the response against the deadline. The engine enforces the
        // deadline itself even if the transport adapter misbehaves.
        let response = tokio::time::timeout(timeout, self.transport.await_response(timeout)).await;
        let frame = match response {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "no attestation response before deadline");
                return self.conclude(InitiatorState::TimedOut);
            },
        };

        let response = match AttestationMessage::decode(&frame) {
            Ok(AttestationMessage::Response(response)) => response,
            Ok(AttestationMessage::Request(_)) => {
                warn!("peer sent a request where a response was expected");
                return self.conclude(InitiatorState::Errored);
            },
            Err(e) => {
                warn!(error = %e, "malformed attestation response");
                return self.conclude(InitiatorState::Errored);
            },
        };

        self.judge(&response, &nonce)
    }

    /// Steps 4a–4e: verify the response and derive the outcome.
    fn judge(self, response: &AttestationResponse, nonce: &Nonce) -> ValidationOutcome {
        // 4a. Signature over `flag ‖ peer_digest ‖ echoed nonce`.
        let preimage = AttestationResponse::signing_preimage(
            response.hash_valid,
            &response.peer_digest,
            &response.nonce,
        );
        let signature_ok = response
            .signature_bytes()
            .is_some_and(|sig| verify(&sig, &preimage, &response.public_key));
        if !signature_ok {
            warn!(cause = %ProtocolError::SignatureInvalid, "attestation response rejected");
            return self.conclude(InitiatorState::Errored);
        }

        // 4b. Anti-replay: the echoed nonce must be ours, verbatim.
        if response.nonce != *nonce {
            warn!(cause = %ProtocolError::NonceMismatch, "attestation response rejected");
            return self.conclude(InitiatorState::Errored);
        }

        // 4c. Identity continuity against the registry.
        let recorded = match self.ctx.recorded_peer_key() {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(error = %e, "cannot read identity registry");
                return ValidationOutcome::Error;
            },
        };
        if let Some(recorded) = &recorded {
            if *recorded != response.public_key {
                warn!(cause = %ProtocolError::PeerIdentityMismatch, "attestation response rejected");
                return self.conclude(InitiatorState::Errored);
            }
        }

        // 4d. The peer's verdict about us.
        if !response.hash_valid {
            warn!(cause = %ProtocolError::HashMismatch, "peer rejected our code digest");
            return self.conclude(InitiatorState::Rejected);
        }

        // 4e. Bootstrap: record the peer key only on a fully-verified,
        // accepted first exchange.
        if recorded.is_none() {
            if let Err(e) = self
                .ctx
                .registry
                .store_peer_key(self.ctx.role.peer(), &response.public_key)
            {
                error!(error = %e, "cannot record peer key during bootstrap");
                return ValidationOutcome::Error;
            }
        }

        self.conclude(InitiatorState::Accepted)
    }

    /// Terminal state → outcome mapping (fail-closed).
    fn conclude(&self, state: InitiatorState) -> ValidationOutcome {
        let outcome = match state {
            InitiatorState::Accepted => ValidationOutcome::Valid,
            InitiatorState::Rejected | InitiatorState::Errored => ValidationOutcome::Tampered,
            InitiatorState::TimedOut => ValidationOutcome::Timeout,
        };
        info!(state = ?state, outcome = ?outcome, "attestation exchange concluded");
        outcome
    }
}

/// Responder-side engine: validates requests and produces signed verdicts.
pub struct Responder {
    ctx: Arc<AttestationContext>,
    expected: ExpectedDigest,
    state: ResponderState,
}

impl Responder {
    /// Create a fresh responder for a single exchange.
    ///
    /// `expected` comes from the build-time artifact, loaded once at
    /// startup; a responder without it cannot be constructed.
    #[must_use]
    pub fn new(ctx: Arc<AttestationContext>, expected: ExpectedDigest) -> Self {
        Self {
            ctx,
            expected,
            state: ResponderState::Idle,
        }
    }

    /// Current exchange state.
    #[must_use]
    pub const fn state(&self) -> ResponderState {
        self.state
    }

    /// Decode a request frame, handle it, and encode the response frame.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for malformed frames or own-side failures;
    /// peer verification failures produce a signed negative response
    /// instead.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>, EngineError> {
        let request = match AttestationMessage::decode(frame)? {
            AttestationMessage::Request(request) => request,
            AttestationMessage::Response(_) => {
                return Err(CodecError::Serialization {
                    reason: "expected a request frame".to_string(),
                }
                .into());
            },
        };
        let response = self.handle(&request)?;
        Ok(AttestationMessage::from(response).encode()?)
    }

    /// Validate `request` and build the signed response.
    ///
    /// Never early-returns on peer verification failure: a negative
    /// verdict is still correctly signed so the initiator can verify the
    /// authenticity of the rejection itself, and reveals no further
    /// detail.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only for own-side failures (signing, digest
    /// computation) or when the exchange was already completed.
    pub fn handle(&mut self, request: &AttestationRequest) -> Result<AttestationResponse, EngineError> {
        if self.state != ResponderState::Idle {
            return Err(EngineError::ExchangeComplete);
        }
        self.state = ResponderState::Validating;

        // Step 1: authenticate the request.
        let preimage = AttestationRequest::signing_preimage(&request.digest, &request.nonce);
        let signature_ok = request
            .signature_bytes()
            .is_some_and(|sig| verify(&sig, &preimage, &request.public_key));
        if !signature_ok {
            warn!(cause = %ProtocolError::SignatureInvalid, "attestation request rejected");
        }

        // Step 2: identity continuity. A registry read failure is
        // fail-closed: respond invalid rather than guessing.
        let (identity_ok, recorded) = match self.ctx.recorded_peer_key() {
            Ok(recorded) => {
                let ok = recorded.as_ref().is_none_or(|r| *r == request.public_key);
                if !ok {
                    warn!(cause = %ProtocolError::PeerIdentityMismatch, "attestation request rejected");
                }
                (ok, recorded)
            },
            Err(e) => {
                error!(error = %e, "cannot read identity registry");
                (false, None)
            },
        };

        // Step 3: compare against the build-time expected digest.
        let hash_ok = request.digest == self.expected.digest();
        if signature_ok && !hash_ok {
            warn!(cause = %ProtocolError::HashMismatch, "initiator digest does not match expected");
        }

        let valid = signature_ok && identity_ok && hash_ok;

        // Step 6: bootstrap the initiator's key once its signature checks
        // out. A hash mismatch alone is not an identity attack, so the
        // key is recorded even then. A write failure is logged and leaves
        // the registry unconfigured for a later retry.
        if signature_ok && identity_ok && recorded.is_none() {
            if let Err(e) = self
                .ctx
                .registry
                .store_peer_key(self.ctx.role.peer(), &request.public_key)
            {
                error!(error = %e, "cannot record initiator key during bootstrap");
            }
        }

        // Steps 4–5: our own digest, signed together with the verdict and
        // the echoed nonce.
        let own_key = self.ctx.ensure_identity()?;
        let peer_digest = self.ctx.self_digest()?;
        let preimage = AttestationResponse::signing_preimage(valid, &peer_digest, &request.nonce);
        let signature = self.ctx.sign(&preimage)?;

        self.state = if valid {
            ResponderState::RepliedValid
        } else {
            ResponderState::RepliedInvalid
        };
        info!(state = ?self.state, "attestation request handled");

        Ok(AttestationResponse {
            hash_valid: valid,
            peer_digest,
            signature: hex::encode(signature),
            public_key: own_key,
            nonce: request.nonce,
            timestamp_ms: now_millis(),
        })
    }
}
