//! TLS 1.2 PRF (RFC 5246 section 5) as a chain of HMAC-SHA256 jobs.
//!
//! ```text
//! P_SHA256(secret, seed) = HMAC(secret, A(1) + seed) + HMAC(secret, A(2) + seed) + ...
//! A(0) = seed, A(i) = HMAC(secret, A(i-1))
//! ```
//!
//! Here `seed` is `label + seed`. One job runs per drive, alternating between
//! an `A` phase and a `Block` phase until enough output is collected.

use std::fmt;

use zeroize::Zeroizing;

use super::orchestrator::{poll_job, start_job, JobState};
use super::{CryptoService, JobOutput, JobRequest};
use crate::engine::ConnectionId;
use crate::types::{AlertDescription, MacAlgorithm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrfPhase {
    A,
    Block,
}

/// Working state of one PRF evaluation. Reused sequentially.
#[derive(Default)]
pub(crate) struct PrfContext {
    secret: Zeroizing<Vec<u8>>,
    seed: Vec<u8>,
    a: Zeroizing<Vec<u8>>,
    out: Zeroizing<Vec<u8>>,
    len: usize,
    state: JobState<PrfPhase, Zeroizing<Vec<u8>>>,
}

impl PrfContext {
    /// Begin `PRF(secret, label, seed)` producing `len` bytes.
    pub fn start(&mut self, secret: &[u8], label: &[u8], seed: &[u8], len: usize) {
        self.secret = Zeroizing::new(secret.to_vec());
        self.seed.clear();
        self.seed.extend_from_slice(label);
        self.seed.extend_from_slice(seed);
        self.a.clear();
        self.out.clear();
        self.len = len;
        self.state = JobState::Start;
    }

    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    pub fn in_flight(&self) -> bool {
        self.state.in_flight()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, JobState::Failed(_))
    }

    pub fn take_ready(&mut self) -> Option<Zeroizing<Vec<u8>>> {
        self.state.take_ready()
    }

    pub fn reset(&mut self) {
        *self = PrfContext::default();
    }

    /// Submit or poll the current HMAC job.
    pub fn drive(
        &mut self,
        crypto: &mut dyn CryptoService,
        owner: ConnectionId,
    ) -> Result<(), AlertDescription> {
        match self.state {
            JobState::Start => {
                // A(1) = HMAC(secret, A(0))
                let request = JobRequest::Mac {
                    alg: MacAlgorithm::HmacSha256,
                    key: &self.secret,
                    data: &self.seed,
                };
                start_job(&mut self.state, crypto, owner, request, PrfPhase::A)
            }
            JobState::Busy { .. } => {
                let Some((phase, outcome)) = poll_job(&self.state, crypto) else {
                    return Ok(());
                };
                let mac = match outcome {
                    Ok(JobOutput::Bytes(mac)) => mac,
                    Ok(other) => {
                        warn!("{} PRF unexpected job output {:?}", owner, other);
                        self.state = JobState::Failed(crate::CryptoError::InvalidInput("prf output"));
                        return Err(AlertDescription::InternalError);
                    }
                    Err(e) => {
                        warn!("{} PRF job failed: {}", owner, e);
                        self.state = JobState::Failed(e);
                        return Err(AlertDescription::InternalError);
                    }
                };

                match phase {
                    PrfPhase::A => {
                        self.a = Zeroizing::new(mac);
                        // HMAC(secret, A(i) + seed)
                        let mut data = Zeroizing::new(Vec::with_capacity(self.a.len() + self.seed.len()));
                        data.extend_from_slice(&self.a);
                        data.extend_from_slice(&self.seed);
                        let request = JobRequest::Mac {
                            alg: MacAlgorithm::HmacSha256,
                            key: &self.secret,
                            data: &data,
                        };
                        start_job(&mut self.state, crypto, owner, request, PrfPhase::Block)
                    }
                    PrfPhase::Block => {
                        let remaining = self.len - self.out.len();
                        let to_copy = remaining.min(mac.len());
                        self.out.extend_from_slice(&mac[..to_copy]);

                        if self.out.len() >= self.len {
                            let out = std::mem::take(&mut self.out);
                            self.state = JobState::Ready(out);
                            return Ok(());
                        }

                        // A(i+1) = HMAC(secret, A(i))
                        let request = JobRequest::Mac {
                            alg: MacAlgorithm::HmacSha256,
                            key: &self.secret,
                            data: &self.a,
                        };
                        start_job(&mut self.state, crypto, owner, request, PrfPhase::A)
                    }
                }
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for PrfContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrfContext")
            .field("len", &self.len)
            .field("produced", &self.out.len())
            .field("busy", &self.state.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    use super::*;
    use crate::crypto::SoftwareCryptoService;

    fn reference(secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
        let mut full_seed = label.to_vec();
        full_seed.extend_from_slice(seed);

        let hmac = |data: &[&[u8]]| {
            let mut m = Hmac::<Sha256>::new_from_slice(secret).unwrap();
            for d in data {
                m.update(d);
            }
            m.finalize().into_bytes().to_vec()
        };

        let mut out = Vec::new();
        let mut a = hmac(&[&full_seed]);
        while out.len() < len {
            let block = hmac(&[&a, &full_seed]);
            out.extend_from_slice(&block);
            a = hmac(&[&a]);
        }
        out.truncate(len);
        out
    }

    fn run(crypto: &mut SoftwareCryptoService, prf: &mut PrfContext) -> Vec<u8> {
        let owner = ConnectionId::new(0, 0);
        for _ in 0..100 {
            prf.drive(crypto, owner).unwrap();
            if let Some(out) = prf.take_ready() {
                return out.to_vec();
            }
        }
        panic!("PRF did not complete");
    }

    #[test]
    fn matches_p_sha256() {
        let mut crypto = SoftwareCryptoService::new();
        let mut prf = PrfContext::default();

        let secret = [0x9b, 0xbe, 0x43, 0x6b, 0xa9, 0x40, 0xf0, 0x17];
        let seed = [0xa0, 0xba, 0x9f, 0x93, 0x6c, 0xda, 0x31, 0x18];

        prf.start(&secret, b"test label", &seed, 100);
        assert_eq!(run(&mut crypto, &mut prf), reference(&secret, b"test label", &seed, 100));
        assert!(prf.is_idle());

        prf.start(&secret, b"client finished", &[1; 32], 12);
        assert_eq!(
            run(&mut crypto, &mut prf),
            reference(&secret, b"client finished", &[1; 32], 12)
        );
    }

    #[test]
    fn survives_latency() {
        let mut crypto = SoftwareCryptoService::new().with_latency(3);
        let mut prf = PrfContext::default();
        prf.start(b"secret", b"master secret", &[7; 64], 48);
        assert_eq!(run(&mut crypto, &mut prf), reference(b"secret", b"master secret", &[7; 64], 48));
    }

    #[test]
    fn failure_is_internal_error() {
        let mut crypto = SoftwareCryptoService::new();
        crypto.fail_next(crate::JobKind::Mac);
        let mut prf = PrfContext::default();
        prf.start(b"secret", b"key expansion", &[0; 64], 40);
        let owner = ConnectionId::new(0, 0);
        prf.drive(&mut crypto, owner).unwrap();
        assert_eq!(prf.drive(&mut crypto, owner), Err(AlertDescription::InternalError));
        assert!(prf.is_failed());
    }
}
