// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::fmt;
use std::str::FromStr;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// RSA signature and ciphertext block size on the wire. Entities sign with
/// 2048-bit keys; request parsing splits payloads at this fixed offset.
pub const RSA_BLOCK_SIZE: usize = 256;

/// AES block size, also the length of the prepended IV.
pub const AES_BLOCK_SIZE: usize = 16;

/// Errors raised by cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("rsa operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("signature rejected")]
    SignatureInvalid,
    #[error("malformed ciphertext or bad padding")]
    BadPadding,
    #[error("ciphertext shorter than one cipher block")]
    ShortCiphertext,
    #[error("key is {found} bytes, cipher {cipher} requires {required}")]
    KeyLength {
        cipher: CipherAlgo,
        required: usize,
        found: usize,
    },
    #[error("unsupported crypto spec {0:?}")]
    UnsupportedSpec(String),
}

/// Block cipher choices for symmetric envelopes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CipherAlgo {
    Aes128Cbc,
    Aes256Cbc,
}

impl CipherAlgo {
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes256Cbc => 32,
        }
    }
}

impl fmt::Display for CipherAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes128Cbc => f.write_str("AES-128-CBC"),
            Self::Aes256Cbc => f.write_str("AES-256-CBC"),
        }
    }
}

/// Hash choices for the payload authentication tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgo {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgo {
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("SHA256"),
            Self::Sha384 => f.write_str("SHA384"),
            Self::Sha512 => f.write_str("SHA512"),
        }
    }
}

/// Cipher plus hash pair protecting a symmetric envelope, with the
/// canonical string form `"AES-128-CBC-SHA256"`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SymmetricCryptoSpec {
    pub cipher: CipherAlgo,
    pub hash: HashAlgo,
}

impl fmt::Display for SymmetricCryptoSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cipher, self.hash)
    }
}

impl FromStr for SymmetricCryptoSpec {
    type Err = CryptoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (cipher_str, hash_str) = value
            .rsplit_once('-')
            .ok_or_else(|| CryptoError::UnsupportedSpec(value.to_string()))?;
        let cipher = match cipher_str {
            "AES-128-CBC" => CipherAlgo::Aes128Cbc,
            "AES-256-CBC" => CipherAlgo::Aes256Cbc,
            _ => return Err(CryptoError::UnsupportedSpec(value.to_string())),
        };
        let hash = match hash_str {
            "SHA256" => HashAlgo::Sha256,
            "SHA384" => HashAlgo::Sha384,
            "SHA512" => HashAlgo::Sha512,
            _ => return Err(CryptoError::UnsupportedSpec(value.to_string())),
        };
        Ok(Self { cipher, hash })
    }
}

/// Holder of the Auth's RSA key pair performing all asymmetric operations.
pub struct AuthCrypto {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    signing_key: SigningKey<Sha256>,
}

impl AuthCrypto {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        let signing_key = SigningKey::<Sha256>::new(private_key.clone());
        Self {
            private_key,
            public_key,
            signing_key,
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// CSPRNG bytes for nonces, IVs, and key material.
    pub fn random_bytes(n: usize) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(vec![0_u8; n]);
        OsRng.fill_bytes(&mut out);
        out
    }

    /// RSA-PKCS#1 v1.5 decryption with the Auth's private key.
    pub fn private_decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let plain = self.private_key.decrypt(Pkcs1v15Encrypt, ciphertext)?;
        Ok(Zeroizing::new(plain))
    }

    /// RSA-PKCS#1 v1.5 encryption to an entity's public key. Plaintext must
    /// not exceed the modulus size minus the 11 padding bytes.
    pub fn public_encrypt(data: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
        Ok(public_key.encrypt(&mut OsRng, Pkcs1v15Encrypt, data)?)
    }

    /// RSA-PKCS#1 v1.5 signature with SHA-256 over `data`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_vec()
    }

    /// Verifies an RSA-PKCS#1 v1.5 SHA-256 signature.
    pub fn verify(
        data: &[u8],
        signature: &[u8],
        public_key: &RsaPublicKey,
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
        let signature =
            Signature::try_from(signature).map_err(|_| CryptoError::SignatureInvalid)?;
        verifying_key
            .verify(data, &signature)
            .map_err(|_| CryptoError::SignatureInvalid)
    }
}

/// AES-CBC encryption with a fresh random IV prepended to the ciphertext.
/// Output layout: `IV || CBC-ciphertext (PKCS#7 padded)`.
pub fn symmetric_encrypt(
    plaintext: &[u8],
    key: &[u8],
    spec: SymmetricCryptoSpec,
) -> Result<Vec<u8>, CryptoError> {
    check_key_len(key, spec.cipher)?;
    let iv = AuthCrypto::random_bytes(AES_BLOCK_SIZE);
    let ciphertext = match spec.cipher {
        CipherAlgo::Aes128Cbc => Aes128CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| key_length_error(key, spec.cipher))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        CipherAlgo::Aes256Cbc => Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| key_length_error(key, spec.cipher))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    };
    let mut out = Vec::with_capacity(AES_BLOCK_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// AES-CBC decryption. Reads the leading block as the IV and strips the
/// PKCS#7 padding from the remainder.
pub fn symmetric_decrypt(
    data: &[u8],
    key: &[u8],
    spec: SymmetricCryptoSpec,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    check_key_len(key, spec.cipher)?;
    if data.len() < 2 * AES_BLOCK_SIZE {
        return Err(CryptoError::ShortCiphertext);
    }
    let (iv, ciphertext) = data.split_at(AES_BLOCK_SIZE);
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::BadPadding);
    }
    let plaintext = match spec.cipher {
        CipherAlgo::Aes128Cbc => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|_| key_length_error(key, spec.cipher))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::BadPadding)?,
        CipherAlgo::Aes256Cbc => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|_| key_length_error(key, spec.cipher))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::BadPadding)?,
    };
    Ok(Zeroizing::new(plaintext))
}

/// Plain cryptographic hash of `data`; the payload tag construction the
/// entities expect on the wire.
pub fn hash(data: &[u8], algo: HashAlgo) -> Vec<u8> {
    match algo {
        HashAlgo::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgo::Sha384 => Sha384::digest(data).to_vec(),
        HashAlgo::Sha512 => Sha512::digest(data).to_vec(),
    }
}

/// Constant-time byte comparison for nonces and payload tags.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn check_key_len(key: &[u8], cipher: CipherAlgo) -> Result<(), CryptoError> {
    if key.len() == cipher.key_len() {
        Ok(())
    } else {
        Err(key_length_error(key, cipher))
    }
}

fn key_length_error(key: &[u8], cipher: CipherAlgo) -> CryptoError {
    CryptoError::KeyLength {
        cipher,
        required: cipher.key_len(),
        found: key.len(),
    }
}
