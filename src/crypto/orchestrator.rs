//! Per operation job state machines.
//!
//! Each crypto operation a connection can have in flight gets its own tagged
//! state. The connection tick submits `Start` states, polls `Busy` states once
//! and moves results into `Ready` for the handshake to consume.

use zeroize::Zeroizing;

use super::{CryptoService, JobId, JobOutput, JobPoll, JobRequest, PrfContext};
use crate::engine::ConnectionId;
use crate::error::CryptoError;
use crate::types::{AlertDescription, ContentType};

/// State of a single crypto operation.
///
/// `P` tags the phase of a multi job operation, `T` is the result.
#[derive(Debug)]
pub(crate) enum JobState<P, T> {
    Idle,
    /// Requested, submitted on the next drive.
    Start,
    Busy {
        job: JobId,
        phase: P,
    },
    Ready(T),
    Failed(CryptoError),
}

impl<P, T> Default for JobState<P, T> {
    fn default() -> Self {
        JobState::Idle
    }
}

impl<P, T> JobState<P, T> {
    pub fn is_idle(&self) -> bool {
        matches!(self, JobState::Idle)
    }

    /// Requested or submitted but not finished.
    pub fn in_flight(&self) -> bool {
        matches!(self, JobState::Start | JobState::Busy { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, JobState::Busy { .. })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, JobState::Ready(_))
    }

    /// Ask for the operation to be submitted on the next drive.
    pub fn request(&mut self) {
        if self.is_idle() {
            *self = JobState::Start;
        }
    }

    /// Take the result, returning the state to idle.
    pub fn take_ready(&mut self) -> Option<T> {
        if !self.is_ready() {
            return None;
        }
        match std::mem::take(self) {
            JobState::Ready(v) => Some(v),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        *self = JobState::Idle;
    }
}

/// Submit `request` and move `state` to busy with `phase`.
///
/// A refused submission leaves the state failed and maps to `internal_error`.
pub(crate) fn start_job<P, T>(
    state: &mut JobState<P, T>,
    crypto: &mut dyn CryptoService,
    owner: ConnectionId,
    request: JobRequest<'_>,
    phase: P,
) -> Result<(), AlertDescription> {
    let kind = request.kind();
    match crypto.start(owner, request) {
        Ok(job) => {
            trace!("{} {:?} job {} started", owner, kind, job.0);
            *state = JobState::Busy { job, phase };
            Ok(())
        }
        Err(e) => {
            warn!("{} {:?} job refused: {}", owner, kind, e);
            *state = JobState::Failed(e);
            Err(AlertDescription::InternalError)
        }
    }
}

/// Poll a busy job once.
///
/// Returns the phase together with the outcome when the job has finished. The
/// caller decides the next state.
pub(crate) fn poll_job<P: Copy, T>(
    state: &JobState<P, T>,
    crypto: &mut dyn CryptoService,
) -> Option<(P, Result<JobOutput, CryptoError>)> {
    let JobState::Busy { job, phase } = state else {
        return None;
    };
    match crypto.poll(*job) {
        JobPoll::Pending => None,
        JobPoll::Done(out) => Some((*phase, Ok(out))),
        JobPoll::Failed(e) => Some((*phase, Err(e))),
    }
}

/// Master secret and key block derivation, layered on the PRF.
#[derive(Debug, Default)]
pub(crate) enum KeyDerive {
    #[default]
    Idle,
    Start,
    Master,
    KeyBlock,
    Ready,
    Failed,
}

impl KeyDerive {
    pub fn in_flight(&self) -> bool {
        matches!(self, KeyDerive::Start | KeyDerive::Master | KeyDerive::KeyBlock)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, KeyDerive::Ready)
    }
}

/// Finished verify data: transcript hash, then PRF.
#[derive(Debug, Default)]
pub(crate) enum VerifyData {
    #[default]
    Idle,
    /// Hash the first `upto` transcript bytes.
    Start {
        upto: usize,
    },
    Hash(JobId),
    /// Hash done, waiting for the PRF to be free.
    AwaitPrf(Vec<u8>),
    Prf,
    Ready([u8; 12]),
    Failed,
}

impl VerifyData {
    pub fn request(&mut self, upto: usize) {
        *self = VerifyData::Start { upto };
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, VerifyData::Idle)
    }

    pub fn in_flight(&self) -> bool {
        matches!(
            self,
            VerifyData::Start { .. } | VerifyData::Hash(_) | VerifyData::AwaitPrf(_) | VerifyData::Prf
        )
    }

    pub fn take_ready(&mut self) -> Option<[u8; 12]> {
        if let VerifyData::Ready(v) = *self {
            *self = VerifyData::Idle;
            return Some(v);
        }
        None
    }
}

/// Phases of signature generation.
///
/// The ServerKeyExchange signature is streamed in four jobs, CertificateVerify
/// is a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignPhase {
    ClientRandom,
    ServerRandom,
    Params,
    Finish,
    Single,
}

/// Record being protected or unprotected by an in-flight job.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordMeta {
    pub ctype: ContentType,
    pub epoch: u16,
    pub seq: u64,
    /// Keep the protected datagram in the flight buffer.
    pub retain: bool,
}

/// Handshake scoped jobs. Dropped with the handshake context.
#[derive(Debug, Default)]
pub(crate) struct HandshakeJobs {
    pub random: JobState<(), Vec<u8>>,
    pub cookie: JobState<(), Vec<u8>>,
    pub key_derive: KeyDerive,
    pub prf: PrfContext,
    pub client_verify: VerifyData,
    pub server_verify: VerifyData,
    pub sig_gen: JobState<SignPhase, Vec<u8>>,
    pub sig_verify: JobState<(), ()>,
    pub cert_verify: JobState<(), Vec<u8>>,
    pub kx_public: JobState<(), Vec<u8>>,
    pub kx_secret: JobState<(), Zeroizing<Vec<u8>>>,
}

impl HandshakeJobs {
    /// Any job submitted and not yet finished.
    pub fn in_flight(&self) -> bool {
        self.random.is_busy()
            || self.cookie.is_busy()
            || self.key_derive.in_flight()
            || self.prf.in_flight()
            || self.client_verify.in_flight()
            || self.server_verify.in_flight()
            || self.sig_gen.in_flight()
            || self.sig_verify.in_flight()
            || self.cert_verify.in_flight()
            || self.kx_public.in_flight()
            || self.kx_secret.in_flight()
    }

    /// Whether a pending handshake result must land before more input is read.
    ///
    /// Verify data and the PRF do not block.
    pub fn blocks_receive(&self) -> bool {
        !self.cookie.is_idle()
            || self.random.is_busy()
            || self.key_derive.in_flight()
            || !self.cert_verify.is_idle()
            || !self.sig_gen.is_idle()
            || !self.sig_verify.is_idle()
            || !self.kx_public.is_idle()
            || !self.kx_secret.is_idle()
    }
}

/// Record protection jobs. Live for the whole connection.
#[derive(Debug, Default)]
pub(crate) struct RecordJobs {
    pub encrypt: JobState<RecordMeta, ()>,
    pub decrypt: JobState<RecordMeta, ()>,
    pub mac_gen: JobState<RecordMeta, ()>,
    pub mac_verify: JobState<RecordMeta, ()>,
}

impl RecordJobs {
    pub fn tx_in_flight(&self) -> bool {
        !self.encrypt.is_idle() || !self.mac_gen.is_idle()
    }

    pub fn rx_in_flight(&self) -> bool {
        !self.decrypt.is_idle() || !self.mac_verify.is_idle()
    }
}
