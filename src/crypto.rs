// SPDX-License-Identifier: MIT

//! All the cryptography-related operations are in this module.
//!
//! rcgen is used to issue the Ed25519 X.509 certificates that make up the
//! server and client TLS identities. The invite handshake is built from
//! X25519 (x25519-dalek), HKDF and HMAC over SHA-512/256, and
//! XChaCha20-Poly1305 for the symmetric encryption of /join responses.

use std::time::Duration;

use anyhow::Context;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use chrono::{DateTime, TimeZone, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ED25519,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::Sha512_256;
use x25519_dalek::{PublicKey, StaticSecret};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};
use zeroize::Zeroizing;

/// Size of symmetric keys, HMAC outputs, nonces, and X25519 keys, in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the XChaCha20-Poly1305 nonce prefixed to ciphertexts, in bytes.
pub const NONCE_SIZE: usize = 24;

const ORGANIZATION: &str = "Sesame";

/// A TLS identity: a certificate chain (leaf first) and its private key.
///
/// This is the unit the server identity and issued client credentials are
/// handled in; [`serialize_tls_cert`] and [`deserialize_tls_cert`] convert it
/// to and from a single PEM bundle.
pub struct TlsCredential {
    chain: Vec<CertificateDer<'static>>,
    key: KeyPair,
}

impl TlsCredential {
    /// The leaf certificate in DER form.
    pub fn leaf_der(&self) -> anyhow::Result<&CertificateDer<'static>> {
        self.chain
            .first()
            .ok_or_else(|| anyhow::anyhow!("no certificate data found in the chain"))
    }

    /// The full certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The private key in PKCS#8 DER form, suitable for rustls.
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key.serialize_der()).into()
    }

    /// Parse the leaf certificate's fields.
    pub fn leaf_info(&self) -> anyhow::Result<CertInfo> {
        parse_cert(self.leaf_der()?)
    }

    /// Find the first CA certificate in the chain.
    ///
    /// Clients use this certificate to pin the server, and the server uses it
    /// to verify client certificates it issued.
    pub fn ca_der(&self) -> anyhow::Result<&CertificateDer<'static>> {
        for der in &self.chain {
            if parse_cert(der)?.is_ca {
                return Ok(der);
            }
        }
        Err(anyhow::anyhow!("no CA certificate found in the chain"))
    }
}

/// The fields of an X.509 certificate the rest of the application cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct CertInfo {
    /// Hex representation of the raw serial number.
    pub serial_number: String,
    /// The subject Common Name.
    pub common_name: String,
    /// DNS entries from the Subject Alternative Name extension.
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
}

/// Parse the fields of a DER-encoded X.509 certificate.
pub fn cert_info(der: &CertificateDer<'_>) -> anyhow::Result<CertInfo> {
    parse_cert(der)
}

fn parse_cert(der: &CertificateDer<'_>) -> anyhow::Result<CertInfo> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|error| anyhow::anyhow!("failed parsing X.509 certificate: {error}"))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut dns_names = vec![];
    if let Some(san) = cert
        .subject_alternative_name()
        .map_err(|error| anyhow::anyhow!("invalid SubjectAlternativeName extension: {error}"))?
    {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_string());
            }
        }
    }

    let is_ca = cert
        .basic_constraints()
        .map_err(|error| anyhow::anyhow!("invalid BasicConstraints extension: {error}"))?
        .map(|constraints| constraints.value.ca)
        .unwrap_or(false);

    Ok(CertInfo {
        serial_number: hex::encode(cert.raw_serial()),
        common_name,
        dns_names,
        not_before: timestamp_to_utc(cert.validity().not_before.timestamp())?,
        not_after: timestamp_to_utc(cert.validity().not_after.timestamp())?,
        is_ca,
    })
}

fn timestamp_to_utc(seconds: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("certificate validity timestamp is out of range"))
}

fn certificate_params(
    subject_name: &str,
    san: &[String],
    now: DateTime<Utc>,
    lifetime: Duration,
    is_ca: bool,
) -> anyhow::Result<CertificateParams> {
    let mut params =
        CertificateParams::new(san.to_vec()).context("invalid subject alternative names")?;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
    distinguished_name.push(DnType::CommonName, subject_name);
    params.distinguished_name = distinguished_name;

    // Serial numbers must be unique per issuer; 128 random bits.
    let serial = random_data(16)?;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.timestamp())
        .context("current time is out of range")?;
    params.not_after = time::OffsetDateTime::from_unix_timestamp(
        now.timestamp() + i64::try_from(lifetime.as_secs()).context("lifetime is out of range")?,
    )
    .context("certificate expiration is out of range")?;

    if is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
    } else {
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    }

    Ok(params)
}

/// Issue a new X.509 v3 certificate with a fresh Ed25519 key.
///
/// If `parent` is `None` the certificate is a self-signed CA usable as both a
/// server and client-auth trust root. Otherwise it is a client-auth leaf
/// signed by the parent's CA certificate; by convention the first SAN entry
/// should be the CA's first DNS SAN, which binds the leaf to the issuing site.
pub fn new_tls_cert(
    subject_name: &str,
    san: &[String],
    now: DateTime<Utc>,
    lifetime: Duration,
    parent: Option<&TlsCredential>,
) -> anyhow::Result<TlsCredential> {
    let params = certificate_params(subject_name, san, now, lifetime, parent.is_none())?;
    let key = KeyPair::generate_for(&PKCS_ED25519).context("failed generating Ed25519 key")?;

    let cert = match parent {
        Some(parent) => {
            let (issuer, issuer_key) = parent.signer()?;
            params
                .signed_by(&key, &issuer, &issuer_key)
                .context("failed signing certificate with the parent key")?
        }
        None => params
            .self_signed(&key)
            .context("failed creating self-signed certificate")?,
    };

    Ok(TlsCredential {
        chain: vec![cert.der().to_owned()],
        key,
    })
}

impl TlsCredential {
    // Reconstruct an rcgen issuer from the stored CA certificate and key. The
    // re-signed certificate is only used for its subject and key identifiers;
    // the DER served to peers remains the stored one.
    fn signer(&self) -> anyhow::Result<(rcgen::Certificate, KeyPair)> {
        let ca_der = self.ca_der()?;
        let ca_pem = pem::encode(&pem::Pem::new("CERTIFICATE", ca_der.to_vec()));
        let params = CertificateParams::from_ca_cert_pem(&ca_pem)
            .context("failed reading CA certificate parameters")?;
        let key = KeyPair::try_from(self.key.serialize_der().as_slice())
            .context("failed reloading the CA private key")?;
        let issuer = params
            .self_signed(&key)
            .context("failed reconstructing the CA certificate")?;
        Ok((issuer, key))
    }
}

/// Re-issue a certificate, preserving its subject, SANs, key usage, and
/// private key. Only the serial number and the validity window change.
pub fn renew_tls_cert(
    credential: &TlsCredential,
    now: DateTime<Utc>,
    lifetime: Duration,
) -> anyhow::Result<TlsCredential> {
    let info = credential.leaf_info()?;
    let params = certificate_params(&info.common_name, &info.dns_names, now, lifetime, info.is_ca)?;
    let key = KeyPair::try_from(credential.key.serialize_der().as_slice())
        .context("failed reloading the private key")?;

    let cert = if info.is_ca {
        params
            .self_signed(&key)
            .context("failed renewing self-signed certificate")?
    } else {
        let (issuer, issuer_key) = credential.signer()?;
        params
            .signed_by(&key, &issuer, &issuer_key)
            .context("failed renewing certificate")?
    };

    let mut chain = vec![cert.der().to_owned()];
    chain.extend(credential.chain.iter().skip(1).cloned());

    Ok(TlsCredential { chain, key })
}

/// Serialize a TLS credential to a single PEM bundle: the certificate chain
/// (leaf first) as `CERTIFICATE` blocks followed by one PKCS#8 `PRIVATE KEY`
/// block.
pub fn serialize_tls_cert(credential: &TlsCredential) -> String {
    let mut bundle = String::new();
    for der in &credential.chain {
        bundle.push_str(&pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec())));
    }
    bundle.push_str(&credential.key.serialize_pem());
    bundle
}

/// Reconstruct a TLS credential from a PEM bundle produced by
/// [`serialize_tls_cert`]. Leading and trailing whitespace is tolerated.
pub fn deserialize_tls_cert(data: &str) -> anyhow::Result<TlsCredential> {
    let data = data.trim();
    let mut reader = std::io::Cursor::new(data.as_bytes());
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("failed parsing certificate blocks")?;
    if chain.is_empty() {
        return Err(anyhow::anyhow!("no CERTIFICATE block found"));
    }

    let mut reader = std::io::Cursor::new(data.as_bytes());
    let key = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .next()
        .ok_or_else(|| anyhow::anyhow!("no PRIVATE KEY block found"))?
        .context("failed parsing the private key block")?;
    let key = KeyPair::try_from(key.secret_pkcs8_der())
        .context("the private key is not usable for signing")?;

    Ok(TlsCredential { chain, key })
}

/// Perform an X25519 key exchange and return the shared secret together with
/// the local public key. A fresh private key is generated when none is given.
pub fn ecdh_exchange(
    remote_pub_key: &[u8],
    priv_key: Option<&[u8]>,
) -> anyhow::Result<(Zeroizing<[u8; KEY_SIZE]>, [u8; KEY_SIZE])> {
    let remote_pub_key: [u8; KEY_SIZE] = remote_pub_key
        .try_into()
        .map_err(|_| anyhow::anyhow!("X25519 public keys must be {KEY_SIZE} bytes"))?;
    let remote_pub_key = PublicKey::from(remote_pub_key);

    let priv_key = match priv_key {
        Some(data) => {
            let data: [u8; KEY_SIZE] = data
                .try_into()
                .map_err(|_| anyhow::anyhow!("X25519 private keys must be {KEY_SIZE} bytes"))?;
            StaticSecret::from(data)
        }
        None => StaticSecret::random_from_rng(OsRng),
    };

    let shared = priv_key.diffie_hellman(&remote_pub_key);
    if !shared.was_contributory() {
        return Err(anyhow::anyhow!("the remote public key is a low-order point"));
    }

    Ok((
        Zeroizing::new(shared.to_bytes()),
        PublicKey::from(&priv_key).to_bytes(),
    ))
}

/// Generate a new X25519 private key.
pub fn new_x25519_key() -> [u8; KEY_SIZE] {
    StaticSecret::random_from_rng(OsRng).to_bytes()
}

/// The public half of an X25519 private key.
pub fn x25519_public_key(priv_key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    PublicKey::from(&StaticSecret::from(*priv_key)).to_bytes()
}

type HmacSha512_256 = Hmac<Sha512_256>;

/// Derive a 256-bit HMAC key from a secret using HKDF-SHA-512/256.
///
/// The secret should be cryptographically strong material, e.g. the result of
/// an ECDH exchange. The info parameter binds the derived key to its context.
pub fn derive_hmac_key(
    secret: &[u8],
    info: &[u8],
) -> anyhow::Result<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha512_256>::new(None, secret);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(info, key.as_mut())
        .map_err(|error| anyhow::anyhow!("failed deriving HMAC key: {error}"))?;
    Ok(key)
}

/// Produce an HMAC-SHA-512/256 tag over the data.
pub fn generate_hmac(data: &[u8], key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut mac = <HmacSha512_256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Check a supplied HMAC tag against the data. The comparison is constant
/// time.
pub fn check_hmac(data: &[u8], supplied_mac: &[u8], key: &[u8; KEY_SIZE]) -> bool {
    let mut mac = <HmacSha512_256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(supplied_mac).is_ok()
}

/// Encrypt data with XChaCha20-Poly1305. The random 24-byte nonce is prefixed
/// to the returned ciphertext.
pub fn encrypt_sym(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> anyhow::Result<Vec<u8>> {
    let key = chacha20poly1305::Key::from(*key);
    let cipher = XChaCha20Poly1305::new(&key);
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow::anyhow!("encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data produced by [`encrypt_sym`]. Fails if the authentication tag
/// is invalid.
pub fn decrypt_sym(data: &[u8], key: &[u8; KEY_SIZE]) -> anyhow::Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(anyhow::anyhow!("ciphertext is too short"));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    let key = chacha20poly1305::Key::from(*key);
    let cipher = XChaCha20Poly1305::new(&key);
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("decryption failed: invalid ciphertext or key"))
}

/// Return `size` cryptographically random bytes.
pub fn random_data(size: usize) -> anyhow::Result<Vec<u8>> {
    if size > isize::MAX as usize {
        return Err(anyhow::anyhow!("invalid random data size {size}"));
    }
    let mut data = vec![0u8; size];
    OsRng
        .try_fill_bytes(&mut data)
        .context("failed generating random data")?;
    Ok(data)
}

/// Generate a 12-character collision-resistant alphanumeric identifier.
pub fn random_id() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    // The CA is self-signed with the usage extensions required to act as a
    // server certificate and a client-auth trust root.
    #[test]
    fn ca_cert_fields() -> Result<()> {
        let ca = new_tls_cert("a-server-id", &["a-server-id".to_string()], Utc::now(), HOUR, None)?;
        let info = ca.leaf_info()?;
        assert!(info.is_ca);
        assert_eq!("a-server-id", info.common_name);
        assert_eq!(vec!["a-server-id".to_string()], info.dns_names);
        // 128-bit serials, modulo DER integer encoding at the edges.
        assert!(info.serial_number.len() >= 30);
        assert!(info.not_after > info.not_before);

        Ok(())
    }

    #[test]
    fn leaf_cert_signed_by_ca() -> Result<()> {
        let now = Utc::now();
        let ca = new_tls_cert("site", &["site".to_string()], now, HOUR, None)?;
        let leaf = new_tls_cert("alice", &["site".to_string()], now, HOUR, Some(&ca))?;

        let info = leaf.leaf_info()?;
        assert!(!info.is_ca);
        assert_eq!("alice", info.common_name);
        assert_eq!(vec!["site".to_string()], info.dns_names);
        assert_ne!(info.serial_number, ca.leaf_info()?.serial_number);

        Ok(())
    }

    // Serializing and deserializing a credential must preserve the chain and
    // the private key.
    #[test]
    fn tls_cert_roundtrip() -> Result<()> {
        let now = Utc::now();
        let ca = new_tls_cert("site", &["site".to_string()], now, HOUR, None)?;
        let leaf = new_tls_cert("alice", &["site".to_string()], now, HOUR, Some(&ca))?;

        let bundle = serialize_tls_cert(&leaf);
        let restored = deserialize_tls_cert(&format!("\n  {bundle}\n"))?;

        assert_eq!(leaf.chain(), restored.chain());
        assert_eq!(leaf.key.serialize_der(), restored.key.serialize_der());

        Ok(())
    }

    // Renewal keeps the subject, SANs, and key; only serial and validity
    // change.
    #[test]
    fn renew_preserves_identity() -> Result<()> {
        let now = Utc::now();
        let ca = new_tls_cert("site", &["site".to_string()], now, HOUR, None)?;
        let renewed = renew_tls_cert(&ca, now + chrono::Duration::hours(1), HOUR)?;

        let old = ca.leaf_info()?;
        let new = renewed.leaf_info()?;
        assert_eq!(old.common_name, new.common_name);
        assert_eq!(old.dns_names, new.dns_names);
        assert_eq!(old.is_ca, new.is_ca);
        assert_ne!(old.serial_number, new.serial_number);
        assert!(new.not_after > old.not_after);
        assert_eq!(ca.key.serialize_der(), renewed.key.serialize_der());

        Ok(())
    }

    // Both sides of an ECDH exchange must derive the same shared secret.
    #[test]
    fn ecdh_agreement() -> Result<()> {
        let server_priv = new_x25519_key();
        let server_pub = x25519_public_key(&server_priv);

        let (client_shared, client_pub) = ecdh_exchange(&server_pub, None)?;
        let (server_shared, _) = ecdh_exchange(&client_pub, Some(&server_priv))?;

        assert_eq!(*client_shared, *server_shared);

        let client_hmac_key = derive_hmac_key(client_shared.as_ref(), b"HMAC key derivation")?;
        let server_hmac_key = derive_hmac_key(server_shared.as_ref(), b"HMAC key derivation")?;
        assert_eq!(*client_hmac_key, *server_hmac_key);

        Ok(())
    }

    #[test]
    fn ecdh_rejects_invalid_keys() {
        assert!(ecdh_exchange(&[0u8; 16], None).is_err());
        let pub_key = x25519_public_key(&new_x25519_key());
        assert!(ecdh_exchange(&pub_key, Some(&[0u8; 7])).is_err());
    }

    #[test]
    fn hmac_check() -> Result<()> {
        let key: [u8; KEY_SIZE] = random_data(KEY_SIZE)?.try_into().unwrap();
        let tag = generate_hmac(b"some data", &key);
        assert!(check_hmac(b"some data", &tag, &key));
        assert!(!check_hmac(b"other data", &tag, &key));

        let mut tampered = tag;
        tampered[0] ^= 0x01;
        assert!(!check_hmac(b"some data", &tampered, &key));

        Ok(())
    }

    // Encrypting and then decrypting should give the plaintext back.
    #[test]
    fn encrypt_decrypt() -> Result<()> {
        let key: [u8; KEY_SIZE] = random_data(KEY_SIZE)?.try_into().unwrap();
        let ciphertext = encrypt_sym(b"attack at dawn", &key)?;
        assert_ne!(b"attack at dawn".as_slice(), &ciphertext[NONCE_SIZE..]);

        let plaintext = decrypt_sym(&ciphertext, &key)?;
        assert_eq!(b"attack at dawn".as_slice(), plaintext);

        Ok(())
    }

    #[test]
    fn decrypt_fails_on_tamper() -> Result<()> {
        let key: [u8; KEY_SIZE] = random_data(KEY_SIZE)?.try_into().unwrap();
        let mut ciphertext = encrypt_sym(b"attack at dawn", &key)?;
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(decrypt_sym(&ciphertext, &key).is_err());

        assert!(decrypt_sym(&[0u8; NONCE_SIZE - 1], &key).is_err());

        Ok(())
    }

    #[test]
    fn random_data_sizes() -> Result<()> {
        assert_eq!(0, random_data(0)?.len());
        assert_eq!(64, random_data(64)?.len());
        assert_ne!(random_data(32)?, random_data(32)?);
        Ok(())
    }

    #[test]
    fn random_id_shape() {
        let id = random_id();
        assert_eq!(12, id.len());
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_id(), random_id());
    }
}
