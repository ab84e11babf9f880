//! Asynchronous crypto service contract.
//!
//! The engine never calls a cryptographic primitive itself. Every operation is a
//! job submitted with [`CryptoService::start`] and then polled once per tick with
//! [`CryptoService::poll`] until it completes. Long lived keys are referenced by
//! [`KeyRef`] into the service's own key store. Ephemeral key exchange secrets and
//! streamed signatures are kept inside the service, keyed by the owning
//! connection.
//!
//! [`SoftwareCryptoService`] is a RustCrypto backed implementation.

mod orchestrator;
mod prf;
mod software;

pub(crate) use orchestrator::{
    poll_job, start_job, HandshakeJobs, JobState, KeyDerive, RecordJobs, RecordMeta, SignPhase,
    VerifyData,
};
pub(crate) use prf::PrfContext;
pub use software::SoftwareCryptoService;

use crate::engine::ConnectionId;
use crate::error::CryptoError;
use crate::types::MacAlgorithm;

/// Handle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

/// Reference to a key held by the crypto service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRef(pub u32);

/// Position of a signature job within a streamed signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// First chunk of a streamed signature.
    Start,
    /// Intermediate chunk.
    Update,
    /// Last chunk, the job output is the signature.
    Finish,
    /// Whole input in one job.
    Single,
}

/// A crypto operation.
#[derive(Debug)]
pub enum JobRequest<'a> {
    /// Random bytes.
    Random { len: usize },
    /// SHA-256 digest.
    Hash { data: &'a [u8] },
    /// HMAC over `data`.
    Mac {
        alg: MacAlgorithm,
        key: &'a [u8],
        data: &'a [u8],
    },
    /// Compare an HMAC in constant time. Output is `Verified` or `Rejected`.
    MacVerify {
        alg: MacAlgorithm,
        key: &'a [u8],
        data: &'a [u8],
        tag: &'a [u8],
    },
    /// AES-GCM encryption. Output is ciphertext followed by the tag.
    AeadSeal {
        key: &'a [u8],
        nonce: &'a [u8; 12],
        aad: &'a [u8],
        plaintext: &'a [u8],
    },
    /// AES-GCM decryption of ciphertext followed by the tag.
    AeadOpen {
        key: &'a [u8],
        nonce: &'a [u8; 12],
        aad: &'a [u8],
        ciphertext: &'a [u8],
    },
    /// ECDSA P-256 SHA-256 signature, DER encoded.
    Sign {
        key: KeyRef,
        mode: StreamMode,
        data: &'a [u8],
    },
    /// ECDSA P-256 SHA-256 verification with a SEC1 public key.
    Verify {
        public_key: &'a [u8],
        data: &'a [u8],
        signature: &'a [u8],
    },
    /// Verify a chain against a trust anchor.
    ///
    /// `certificates` is a TLS certificate_list body: 24-bit length prefixed DER
    /// certificates, leaf first. Output is the leaf public key, or `Rejected`.
    VerifyChain {
        certificates: &'a [u8],
        anchor: &'a [u8],
    },
    /// Generate an ephemeral x25519 key pair. Output is the public value.
    KeyExchangePublic,
    /// Complete the key exchange with the peer's public value.
    KeyExchangeSecret { peer: &'a [u8] },
}

/// Kind of a [`JobRequest`], used for failure injection and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Random,
    Hash,
    Mac,
    MacVerify,
    AeadSeal,
    AeadOpen,
    Sign,
    Verify,
    VerifyChain,
    KeyExchangePublic,
    KeyExchangeSecret,
}

impl JobRequest<'_> {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Random { .. } => JobKind::Random,
            JobRequest::Hash { .. } => JobKind::Hash,
            JobRequest::Mac { .. } => JobKind::Mac,
            JobRequest::MacVerify { .. } => JobKind::MacVerify,
            JobRequest::AeadSeal { .. } => JobKind::AeadSeal,
            JobRequest::AeadOpen { .. } => JobKind::AeadOpen,
            JobRequest::Sign { .. } => JobKind::Sign,
            JobRequest::Verify { .. } => JobKind::Verify,
            JobRequest::VerifyChain { .. } => JobKind::VerifyChain,
            JobRequest::KeyExchangePublic => JobKind::KeyExchangePublic,
            JobRequest::KeyExchangeSecret { .. } => JobKind::KeyExchangeSecret,
        }
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Bytes(Vec<u8>),
    Verified,
    Rejected,
}

/// Answer to [`CryptoService::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPoll {
    Pending,
    Done(JobOutput),
    Failed(CryptoError),
}

/// Job based crypto provider.
pub trait CryptoService {
    /// Submit a job on behalf of `owner`.
    fn start(&mut self, owner: ConnectionId, request: JobRequest<'_>) -> Result<JobId, CryptoError>;

    /// Poll a submitted job. A job is forgotten once it reports done or failed.
    fn poll(&mut self, job: JobId) -> JobPoll;

    /// Drop all jobs and ephemeral state of a released connection.
    fn release(&mut self, _owner: ConnectionId) {}
}
