// RSA primitives for key-possession authentication
// Public keys travel as PKCS#1 PEM and are stored as hex of their DER encoding.
// Signatures are PKCS#1 v1.5 over SHA-256, nonce encryption is PKCS#1 v1.5.
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{Signer, Verifier};
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::error::{Error, Result};

/// An RSA public key. Equality compares modulus and exponent.
#[derive(Clone)]
pub struct PublicKey(Rsa<Public>);

impl PublicKey {
    /// Decode the armored form. Accepts PKCS#1 (`RSA PUBLIC KEY`) and
    /// SPKI (`PUBLIC KEY`) PEM.
    pub fn from_pem(pem: &str) -> Result<PublicKey> {
        let bytes = pem.trim().as_bytes();
        Rsa::public_key_from_pem_pkcs1(bytes)
            .or_else(|_| Rsa::public_key_from_pem(bytes))
            .map(PublicKey)
            .map_err(|_| Error::invalid("invalid public key"))
    }

    /// Canonical armored form (PKCS#1 PEM). This exact string is what
    /// trust messages must embed.
    pub fn to_pem(&self) -> Result<String> {
        let pem = self.0.public_key_to_pem_pkcs1()?;
        String::from_utf8(pem).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Decode the compact storage form (hex of PKCS#1 DER).
    pub fn from_compact(compact: &str) -> Result<PublicKey> {
        let der = hex::decode(compact).map_err(|_| Error::invalid("invalid public key"))?;
        Rsa::public_key_from_der_pkcs1(&der)
            .map(PublicKey)
            .map_err(|_| Error::invalid("invalid public key"))
    }

    /// Compact storage form, used as the lookup key and uniqueness constraint.
    pub fn to_compact(&self) -> Result<String> {
        Ok(hex::encode(self.0.public_key_to_der_pkcs1()?))
    }

    pub fn bits(&self) -> u32 {
        self.0.size() * 8
    }

    fn pkey(&self) -> Result<PKey<Public>, ErrorStack> {
        PKey::from_rsa(self.0.clone())
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.n() == other.0.n() && self.0.e() == other.0.e()
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({} bits)", self.bits())
    }
}

/// An RSA private key together with its public half.
pub struct KeyPair {
    private_key: PKey<Private>,
    public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new RSA keypair
    /// Arguments:
    /// * `bits` - The key size in bits (typically 2048 or 4096)
    pub fn generate(bits: u32) -> Result<KeyPair> {
        let rsa = Rsa::generate(bits)?;
        Self::from_private(PKey::from_rsa(rsa)?)
    }

    /// Parse a private key from PEM (PKCS#8 or PKCS#1).
    pub fn from_pem(pem: &[u8]) -> Result<KeyPair> {
        let private_key =
            PKey::private_key_from_pem(pem).map_err(|_| Error::invalid("invalid private key"))?;
        Self::from_private(private_key)
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.private_key.private_key_to_pem_pkcs8()?)
    }

    fn from_private(private_key: PKey<Private>) -> Result<KeyPair> {
        let rsa = private_key.rsa()?;
        let public_key_der = rsa.public_key_to_der()?;
        let public_key = PublicKey(Rsa::public_key_from_der(&public_key_der)?);
        Ok(KeyPair { private_key, public_key })
    }

    /// Load the key at `path`, or generate one and save it there.
    /// Returns the key and whether it was freshly generated.
    pub fn load_or_generate(path: &Path, bits: u32) -> Result<(KeyPair, bool)> {
        if path.exists() {
            let pem = fs::read(path)?;
            return Ok((Self::from_pem(&pem)?, false));
        }

        let keys = Self::generate(bits)?;
        keys.save(path)?;
        Ok((keys, true))
    }

    /// Write the private key as PKCS#8 PEM. Refuses to overwrite.
    pub fn save(&self, path: &Path) -> Result<()> {
        let pem = self.to_pem()?;
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&pem)?;
        Ok(())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign `message` (PKCS#1 v1.5, SHA-256).
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.private_key)?;
        signer.update(message)?;
        Ok(signer.sign_to_vec()?)
    }

    /// Recover a plaintext produced by [`encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let rsa = self.private_key.rsa()?;
        let mut buf = vec![0; rsa.size() as usize];
        let len = rsa
            .private_decrypt(ciphertext, &mut buf, Padding::PKCS1)
            .map_err(|_| Error::invalid("could not decrypt"))?;
        buf.truncate(len);
        Ok(buf)
    }

    pub fn decrypt_from_base64(&self, base64_ciphertext: &str) -> Result<Vec<u8>> {
        let ciphertext = decode_base64(base64_ciphertext)?;
        self.decrypt(&ciphertext)
    }
}

/// Verify `signature` over `message` under `public_key`.
/// Returns false on any malformed input, wrong key or wrong digest.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let check = || -> Result<bool, ErrorStack> {
        let pkey = public_key.pkey()?;
        let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey)?;
        verifier.update(message)?;
        verifier.verify(signature)
    };
    check().unwrap_or(false)
}

/// Encrypt `plaintext` so only the holder of the matching private key can read it.
pub fn encrypt(public_key: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let rsa = &public_key.0;
    let mut buf = vec![0; rsa.size() as usize];
    let len = rsa.public_encrypt(plaintext, &mut buf, Padding::PKCS1)?;
    buf.truncate(len);
    Ok(buf)
}

/// Encrypt a plaintext and return base64-encoded ciphertext
pub fn encrypt_to_base64(public_key: &PublicKey, plaintext: &[u8]) -> Result<String> {
    Ok(STANDARD.encode(encrypt(public_key, plaintext)?))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|_| Error::invalid("invalid base64"))
}

/// Random `[0-9a-zA-Z]` string of `len` characters from the thread CSPRNG.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
pub(crate) fn test_keypair() -> KeyPair {
    KeyPair::generate(1024).expect("generate test key")
}
