//! Crypto service backed by RustCrypto.
//!
//! Results are computed when a job is submitted and released after a
//! configurable number of polls, so callers see the same pending/done sequence
//! as with a hardware accelerator.

use std::collections::HashMap;
use std::fmt;

use der::{Decode, Encode};
use hmac::{Hmac, Mac};
use nom::multi::many1;
use nom::number::complete::be_u24;
use nom::{combinator::all_consuming, multi::length_data, IResult};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use pkcs8::DecodePrivateKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use signature::hazmat::PrehashSigner;
use signature::Verifier;
use spki::ObjectIdentifier;
use x25519_dalek::{EphemeralSecret, PublicKey};
use x509_cert::Certificate;

use super::{CryptoService, JobId, JobKind, JobOutput, JobPoll, JobRequest, KeyRef, StreamMode};
use crate::engine::ConnectionId;
use crate::error::CryptoError;
use crate::types::MacAlgorithm;

const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

struct Pending {
    owner: ConnectionId,
    polls_left: u32,
    outcome: Result<JobOutput, CryptoError>,
}

/// Software [`CryptoService`].
///
/// Signing keys are imported once with [`import_signing_key`] and referenced
/// by [`KeyRef`] from configuration.
///
/// [`import_signing_key`]: SoftwareCryptoService::import_signing_key
pub struct SoftwareCryptoService {
    latency: u32,
    next_job: u64,
    next_key: u32,
    jobs: HashMap<JobId, Pending>,
    keys: HashMap<KeyRef, SigningKey>,
    exchanges: HashMap<ConnectionId, EphemeralSecret>,
    streams: HashMap<ConnectionId, Sha256>,
    fail: Vec<JobKind>,
}

impl SoftwareCryptoService {
    pub fn new() -> Self {
        SoftwareCryptoService {
            latency: 0,
            next_job: 1,
            next_key: 1,
            jobs: HashMap::new(),
            keys: HashMap::new(),
            exchanges: HashMap::new(),
            streams: HashMap::new(),
            fail: Vec::new(),
        }
    }

    /// Report every job as pending for `polls` polls before completing it.
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    /// Import a PKCS#8 DER encoded P-256 private key.
    pub fn import_signing_key(&mut self, pkcs8_der: &[u8]) -> Result<KeyRef, CryptoError> {
        let key = SigningKey::from_pkcs8_der(pkcs8_der).map_err(|_| CryptoError::InvalidKey)?;
        let key_ref = KeyRef(self.next_key);
        self.next_key += 1;
        self.keys.insert(key_ref, key);
        Ok(key_ref)
    }

    /// Make the next job of `kind` fail.
    pub fn fail_next(&mut self, kind: JobKind) {
        self.fail.push(kind);
    }

    /// Jobs submitted and not yet collected.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    fn execute(&mut self, owner: ConnectionId, request: JobRequest<'_>) -> Result<JobOutput, CryptoError> {
        match request {
            JobRequest::Random { len } => {
                let mut out = vec![0; len];
                OsRng.fill_bytes(&mut out);
                Ok(JobOutput::Bytes(out))
            }
            JobRequest::Hash { data } => Ok(JobOutput::Bytes(Sha256::digest(data).to_vec())),
            JobRequest::Mac { alg, key, data } => Ok(JobOutput::Bytes(hmac(alg, key, data)?)),
            JobRequest::MacVerify {
                alg,
                key,
                data,
                tag,
            } => Ok(hmac_verify(alg, key, data, tag)?),
            JobRequest::AeadSeal {
                key,
                nonce,
                aad,
                plaintext,
            } => aead_seal(key, nonce, aad, plaintext).map(JobOutput::Bytes),
            JobRequest::AeadOpen {
                key,
                nonce,
                aad,
                ciphertext,
            } => aead_open(key, nonce, aad, ciphertext),
            JobRequest::Sign { key, mode, data } => self.sign(owner, key, mode, data),
            JobRequest::Verify {
                public_key,
                data,
                signature,
            } => Ok(verify(public_key, data, signature)),
            JobRequest::VerifyChain {
                certificates,
                anchor,
            } => Ok(verify_chain(certificates, anchor)),
            JobRequest::KeyExchangePublic => {
                let secret = EphemeralSecret::random_from_rng(OsRng);
                let public = PublicKey::from(&secret);
                self.exchanges.insert(owner, secret);
                Ok(JobOutput::Bytes(public.as_bytes().to_vec()))
            }
            JobRequest::KeyExchangeSecret { peer } => {
                let secret = self.exchanges.remove(&owner).ok_or(CryptoError::NoKeyExchange)?;
                let Ok(peer) = <[u8; 32]>::try_from(peer) else {
                    return Ok(JobOutput::Rejected);
                };
                let shared = secret.diffie_hellman(&PublicKey::from(peer));
                if !shared.was_contributory() {
                    return Ok(JobOutput::Rejected);
                }
                Ok(JobOutput::Bytes(shared.as_bytes().to_vec()))
            }
        }
    }

    fn sign(
        &mut self,
        owner: ConnectionId,
        key: KeyRef,
        mode: StreamMode,
        data: &[u8],
    ) -> Result<JobOutput, CryptoError> {
        let signing_key = self.keys.get(&key).ok_or(CryptoError::UnknownKey(key.0))?;

        let digest = match mode {
            StreamMode::Start => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                self.streams.insert(owner, hasher);
                return Ok(JobOutput::Bytes(Vec::new()));
            }
            StreamMode::Update => {
                let hasher = self
                    .streams
                    .get_mut(&owner)
                    .ok_or(CryptoError::InvalidInput("no signature stream"))?;
                hasher.update(data);
                return Ok(JobOutput::Bytes(Vec::new()));
            }
            StreamMode::Finish => {
                let mut hasher = self
                    .streams
                    .remove(&owner)
                    .ok_or(CryptoError::InvalidInput("no signature stream"))?;
                hasher.update(data);
                hasher.finalize()
            }
            StreamMode::Single => Sha256::digest(data),
        };

        let signature: Signature = signing_key
            .sign_prehash(&digest)
            .map_err(|e| CryptoError::Backend(e.to_string()))?;
        Ok(JobOutput::Bytes(signature.to_der().as_bytes().to_vec()))
    }
}

impl Default for SoftwareCryptoService {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoService for SoftwareCryptoService {
    fn start(&mut self, owner: ConnectionId, request: JobRequest<'_>) -> Result<JobId, CryptoError> {
        let kind = request.kind();

        let outcome = if let Some(pos) = self.fail.iter().position(|k| *k == kind) {
            self.fail.remove(pos);
            Err(CryptoError::Injected)
        } else {
            self.execute(owner, request)
        };

        let job = JobId(self.next_job);
        self.next_job += 1;
        self.jobs.insert(
            job,
            Pending {
                owner,
                polls_left: self.latency,
                outcome,
            },
        );
        Ok(job)
    }

    fn poll(&mut self, job: JobId) -> JobPoll {
        let Some(pending) = self.jobs.get_mut(&job) else {
            return JobPoll::Failed(CryptoError::UnknownJob);
        };
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return JobPoll::Pending;
        }
        match self.jobs.remove(&job).map(|p| p.outcome) {
            Some(Ok(out)) => JobPoll::Done(out),
            Some(Err(e)) => JobPoll::Failed(e),
            None => JobPoll::Failed(CryptoError::UnknownJob),
        }
    }

    fn release(&mut self, owner: ConnectionId) {
        self.jobs.retain(|_, p| p.owner != owner);
        self.exchanges.remove(&owner);
        self.streams.remove(&owner);
    }
}

impl fmt::Debug for SoftwareCryptoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareCryptoService")
            .field("latency", &self.latency)
            .field("jobs", &self.jobs.len())
            .field("keys", &self.keys.len())
            .finish()
    }
}

fn hmac(alg: MacAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let out = match alg {
        MacAlgorithm::HmacSha1 => {
            let mut m = <Hmac<Sha1> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            m.update(data);
            m.finalize().into_bytes().to_vec()
        }
        MacAlgorithm::HmacSha256 => {
            let mut m = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            m.update(data);
            m.finalize().into_bytes().to_vec()
        }
    };
    Ok(out)
}

fn hmac_verify(alg: MacAlgorithm, key: &[u8], data: &[u8], tag: &[u8]) -> Result<JobOutput, CryptoError> {
    let ok = match alg {
        MacAlgorithm::HmacSha1 => {
            let mut m = <Hmac<Sha1> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            m.update(data);
            m.verify_slice(tag).is_ok()
        }
        MacAlgorithm::HmacSha256 => {
            let mut m = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            m.update(data);
            m.verify_slice(tag).is_ok()
        }
    };
    Ok(if ok { JobOutput::Verified } else { JobOutput::Rejected })
}

fn aead_seal(key: &[u8], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{Aes128Gcm, Nonce};

    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Backend("AES-GCM seal failed".into()))
}

fn aead_open(key: &[u8], nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<JobOutput, CryptoError> {
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{Aes128Gcm, Nonce};

    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    match cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad }) {
        Ok(plaintext) => Ok(JobOutput::Bytes(plaintext)),
        Err(_) => Ok(JobOutput::Rejected),
    }
}

fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> JobOutput {
    let Ok(key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return JobOutput::Rejected;
    };
    let Ok(signature) = Signature::from_der(signature) else {
        return JobOutput::Rejected;
    };
    match key.verify(data, &signature) {
        Ok(()) => JobOutput::Verified,
        Err(_) => JobOutput::Rejected,
    }
}

fn certificate_list(input: &[u8]) -> IResult<&[u8], Vec<&[u8]>> {
    all_consuming(many1(length_data(be_u24)))(input)
}

/// Check that `issuer` signed `cert` with ECDSA P-256 SHA-256.
fn issued_by(cert: &Certificate, issuer: &Certificate) -> bool {
    if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return false;
    }
    if cert.signature_algorithm.oid != ECDSA_WITH_SHA256 {
        return false;
    }
    let Ok(tbs) = cert.tbs_certificate.to_der() else {
        return false;
    };
    let Some(signature) = cert.signature.as_bytes() else {
        return false;
    };
    let Some(key) = issuer
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
    else {
        return false;
    };
    verify(key, &tbs, signature) == JobOutput::Verified
}

fn verify_chain(certificates: &[u8], anchor: &[u8]) -> JobOutput {
    let Ok((_, ders)) = certificate_list(certificates) else {
        return JobOutput::Rejected;
    };
    let Ok(anchor_cert) = Certificate::from_der(anchor) else {
        return JobOutput::Rejected;
    };

    let mut chain = Vec::with_capacity(ders.len());
    for der in &ders {
        match Certificate::from_der(der) {
            Ok(c) => chain.push(c),
            Err(_) => return JobOutput::Rejected,
        }
    }

    // A peer may include the anchor itself at the end.
    if ders.len() > 1 && ders[ders.len() - 1] == anchor {
        chain.pop();
    }

    for i in 0..chain.len() {
        let issuer = chain.get(i + 1).unwrap_or(&anchor_cert);
        if !issued_by(&chain[i], issuer) {
            debug!("Certificate {} not issued by its successor", i);
            return JobOutput::Rejected;
        }
    }

    let spki = &chain[0].tbs_certificate.subject_public_key_info;
    if spki.algorithm.oid != EC_PUBLIC_KEY {
        return JobOutput::Rejected;
    }
    match spki.subject_public_key.as_bytes() {
        Some(key) => JobOutput::Bytes(key.to_vec()),
        None => JobOutput::Rejected,
    }
}
