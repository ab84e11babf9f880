//! Certificate helpers.
//!
//! Generate a P-256 certificate authority and issue end entity certificates
//! from it, suitable for the ECDHE-ECDSA suites. Keys are PKCS#8 DER ready for
//! [`SoftwareCryptoService::import_signing_key`](crate::SoftwareCryptoService::import_signing_key).

use std::fmt;

use der::{Decode, Encode};
use rcgen::{
    BasicConstraints, Certificate as RcgenCertificate, CertificateParams, DistinguishedName,
    DnType, IsCa, KeyPair, PKCS_ECDSA_P256_SHA256,
};
use zeroize::Zeroizing;

/// Certificate utility error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    /// Invalid certificate format
    InvalidFormat,
    /// Certificate generation failed
    GenerationFailed,
}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateError::InvalidFormat => write!(f, "Invalid certificate format"),
            CertificateError::GenerationFailed => write!(f, "Certificate generation failed"),
        }
    }
}

impl std::error::Error for CertificateError {}

/// Certificate and private key pair
#[derive(Clone)]
pub struct CertifiedKey {
    /// Certificate in DER format
    pub certificate: Vec<u8>,
    /// Private key in PKCS#8 DER format
    pub private_key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for CertifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedKey")
            .field("certificate", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

/// A self-signed P-256 certificate authority.
pub struct CertificateAuthority {
    cert: RcgenCertificate,
    der: Vec<u8>,
}

impl CertificateAuthority {
    /// Generate a new authority with the given common name.
    pub fn new(common_name: &str) -> Result<Self, CertificateError> {
        let mut params = params(common_name)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let cert =
            RcgenCertificate::from_params(params).map_err(|_| CertificateError::GenerationFailed)?;
        let der = cert
            .serialize_der()
            .map_err(|_| CertificateError::GenerationFailed)?;

        Ok(CertificateAuthority { cert, der })
    }

    /// The authority certificate in DER, used as trust anchor.
    pub fn certificate(&self) -> &[u8] {
        &self.der
    }

    /// Issue an end entity certificate signed by this authority.
    pub fn issue(&self, common_name: &str) -> Result<CertifiedKey, CertificateError> {
        let mut params = params(common_name)?;
        params.is_ca = IsCa::NoCa;

        let cert =
            RcgenCertificate::from_params(params).map_err(|_| CertificateError::GenerationFailed)?;
        let certificate = cert
            .serialize_der_with_signer(&self.cert)
            .map_err(|_| CertificateError::GenerationFailed)?;

        Ok(CertifiedKey {
            certificate,
            private_key: Zeroizing::new(cert.serialize_private_key_der()),
        })
    }
}

/// Generate a self-signed end entity certificate.
///
/// The certificate is its own trust anchor.
pub fn generate_self_signed(common_name: &str) -> Result<CertifiedKey, CertificateError> {
    let params = params(common_name)?;
    let cert =
        RcgenCertificate::from_params(params).map_err(|_| CertificateError::GenerationFailed)?;
    let certificate = cert
        .serialize_der()
        .map_err(|_| CertificateError::GenerationFailed)?;

    Ok(CertifiedKey {
        certificate,
        private_key: Zeroizing::new(cert.serialize_private_key_der()),
    })
}

/// DER encoded subject name of a certificate.
///
/// Suitable for [`ConfigBuilder::ca_name`](crate::ConfigBuilder::ca_name).
pub fn subject_name(certificate: &[u8]) -> Result<Vec<u8>, CertificateError> {
    let cert =
        x509_cert::Certificate::from_der(certificate).map_err(|_| CertificateError::InvalidFormat)?;
    cert.tbs_certificate
        .subject
        .to_der()
        .map_err(|_| CertificateError::InvalidFormat)
}

fn params(common_name: &str) -> Result<CertificateParams, CertificateError> {
    let key_pair =
        KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(|_| CertificateError::GenerationFailed)?;

    let mut params = CertificateParams::new(vec![common_name.to_string()]);
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.key_pair = Some(key_pair);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name.to_string());
    params.distinguished_name = distinguished_name;

    // Set validity period (1 year)
    let not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(366);

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_certificate_names_its_authority() {
        let ca = CertificateAuthority::new("Engine CA").unwrap();
        let leaf = ca.issue("device").unwrap();

        let ca_subject = subject_name(ca.certificate()).unwrap();
        let leaf_cert = x509_cert::Certificate::from_der(&leaf.certificate).unwrap();
        assert_eq!(leaf_cert.tbs_certificate.issuer.to_der().unwrap(), ca_subject);
        assert!(!leaf.private_key.is_empty());
    }

    #[test]
    fn self_signed_parses() {
        let cert = generate_self_signed("peer").unwrap();
        assert!(subject_name(&cert.certificate).is_ok());
        assert_eq!(subject_name(b"junk"), Err(CertificateError::InvalidFormat));
    }
}
