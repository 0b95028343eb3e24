// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The negotiated ECDH crypto suite.
//!
//! A suite pairs one curve with one hash. Blinding hashes an input to a
//! curve point and multiplies it by a private scalar; evaluating multiplies
//! an already-blinded point by the local scalar. Scalar multiplication
//! commutes, so both parties arrive at the same doubly-blinded value for
//! equal inputs.
//!
//! `SM2`/`SM3`, `SECP256K1` and `P256` remain in the wire enums for
//! handshake compatibility but are not backed in this build; constructing a
//! suite over them fails with `HandshakeFailed`.

use blake2::Blake2b512;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use veil_types::{EccCurve, HashAlg, PpcError};

use crate::config::PsiConfig;

/// Compressed point and scalar sizes for the supported curves.
pub const POINT_SIZE: usize = 32;
pub const SCALAR_SIZE: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct EcdhSuite {
    curve: EccCurve,
    hash: HashAlg,
}

impl EcdhSuite {
    pub fn new(curve: EccCurve, hash: HashAlg) -> Result<Self, PpcError> {
        if !Self::curve_supported(curve) {
            return Err(PpcError::HandshakeFailed(format!(
                "curve {curve:?} is not backed in this build"
            )));
        }
        if !Self::hash_supported(hash) {
            return Err(PpcError::HandshakeFailed(format!(
                "hash {hash:?} is not backed in this build"
            )));
        }
        Ok(EcdhSuite { curve, hash })
    }

    pub fn curve_supported(curve: EccCurve) -> bool {
        matches!(curve, EccCurve::Ed25519 | EccCurve::IppX25519)
    }

    pub fn hash_supported(hash: HashAlg) -> bool {
        matches!(
            hash,
            HashAlg::Sha256 | HashAlg::Sha512 | HashAlg::Blake2b | HashAlg::Md5
        )
    }

    pub fn curve(&self) -> EccCurve {
        self.curve
    }

    pub fn hash(&self) -> HashAlg {
        self.hash
    }

    /// A fresh uniformly distributed private scalar.
    pub fn random_scalar(&self) -> Vec<u8> {
        let mut wide = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut wide);
        Scalar::from_bytes_mod_order_wide(&wide).to_bytes().to_vec()
    }

    fn scalar(key: &[u8]) -> Result<Scalar, PpcError> {
        let bytes: [u8; SCALAR_SIZE] = key
            .try_into()
            .map_err(|_| PpcError::BlindData(format!("bad scalar length {}", key.len())))?;
        Ok(Scalar::from_bytes_mod_order(bytes))
    }

    /// Expand `input` to 64 uniform bytes under the negotiated hash.
    fn hash_wide(&self, input: &[u8]) -> [u8; 64] {
        let mut wide = [0u8; 64];
        match self.hash {
            HashAlg::Sha512 => {
                wide.copy_from_slice(&Sha512::digest(input));
            }
            HashAlg::Sha256 => {
                let first = Sha256::digest(input);
                let second = Sha256::digest(first);
                wide[..32].copy_from_slice(&first);
                wide[32..].copy_from_slice(&second);
            }
            HashAlg::Blake2b => {
                wide.copy_from_slice(&Blake2b512::digest(input));
            }
            HashAlg::Md5 => {
                // widen the 16-byte digest by chaining
                let mut block = Md5::digest(input);
                for chunk in wide.chunks_mut(16) {
                    chunk.copy_from_slice(&block);
                    block = Md5::digest(block);
                }
            }
            // rejected at construction
            HashAlg::Sm3 => unreachable!("sm3 suites cannot be constructed"),
        }
        wide
    }

    /// Hash `input` to a curve point and multiply by the private scalar.
    pub fn blind(&self, input: &[u8], key: &[u8]) -> Result<Vec<u8>, PpcError> {
        let scalar = Self::scalar(key)?;
        let wide = self.hash_wide(input);
        match self.curve {
            EccCurve::Ed25519 => {
                let point = RistrettoPoint::from_uniform_bytes(&wide);
                Ok((point * scalar).compress().to_bytes().to_vec())
            }
            EccCurve::IppX25519 => {
                let mut raw = [0u8; POINT_SIZE];
                raw.copy_from_slice(&wide[..POINT_SIZE]);
                Ok((MontgomeryPoint(raw) * scalar).to_bytes().to_vec())
            }
            _ => unreachable!("unsupported curves are rejected at construction"),
        }
    }

    /// Multiply an already-blinded point by the private scalar.
    pub fn evaluate(&self, point: &[u8], key: &[u8]) -> Result<Vec<u8>, PpcError> {
        let scalar = Self::scalar(key)?;
        match self.curve {
            EccCurve::Ed25519 => {
                let compressed = CompressedRistretto::from_slice(point)
                    .map_err(|_| PpcError::BlindData(format!("bad point length {}", point.len())))?;
                let decompressed = compressed
                    .decompress()
                    .ok_or_else(|| PpcError::BlindData("point not on curve".into()))?;
                Ok((decompressed * scalar).compress().to_bytes().to_vec())
            }
            EccCurve::IppX25519 => {
                let raw: [u8; POINT_SIZE] = point
                    .try_into()
                    .map_err(|_| PpcError::BlindData(format!("bad point length {}", point.len())))?;
                Ok((MontgomeryPoint(raw) * scalar).to_bytes().to_vec())
            }
            _ => unreachable!("unsupported curves are rejected at construction"),
        }
    }

    pub fn blind_batch(&self, inputs: &[Vec<u8>], key: &[u8]) -> Result<Vec<Vec<u8>>, PpcError> {
        inputs.iter().map(|input| self.blind(input, key)).collect()
    }

    pub fn evaluate_batch(&self, points: &[Vec<u8>], key: &[u8]) -> Result<Vec<Vec<u8>>, PpcError> {
        points.iter().map(|point| self.evaluate(point, key)).collect()
    }
}

/// Pick the crypto suite for a handshake request.
///
/// When SM crypto is preferred and both sides support SM2 and SM3, that
/// pair wins. Otherwise the first element of the client's list that the
/// local side also supports is selected, independently for curve and hash.
/// Returns `(-1, -1)`-style `None`s when nothing is common.
pub fn select_suite(
    config: &PsiConfig,
    client_curves: &[i8],
    client_hashes: &[i8],
) -> (Option<EccCurve>, Option<HashAlg>) {
    let local_curves: Vec<i8> = config.supported_curves.iter().map(|c| *c as i8).collect();
    let local_hashes: Vec<i8> = config.supported_hashes.iter().map(|h| *h as i8).collect();

    let mut curve = None;
    let mut hash = None;
    if config.prefer_sm_crypto {
        let sm2 = EccCurve::Sm2 as i8;
        let sm3 = HashAlg::Sm3 as i8;
        if client_curves.contains(&sm2) && local_curves.contains(&sm2) {
            curve = Some(EccCurve::Sm2);
        }
        if client_hashes.contains(&sm3) && local_hashes.contains(&sm3) {
            hash = Some(HashAlg::Sm3);
        }
    }
    if curve.is_none() {
        curve = client_curves
            .iter()
            .find(|c| local_curves.contains(c))
            .and_then(|c| EccCurve::from_i8(*c));
    }
    if hash.is_none() {
        hash = client_hashes
            .iter()
            .find(|h| local_hashes.contains(h))
            .and_then(|h| HashAlg::from_i8(*h));
    }
    (curve, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_blinding_commutes() {
        for curve in [EccCurve::Ed25519, EccCurve::IppX25519] {
            let suite = EcdhSuite::new(curve, HashAlg::Sha256).unwrap();
            let key_a = suite.random_scalar();
            let key_b = suite.random_scalar();
            for input in [&b"alice"[..], b"", b"\x00\x01\x02"] {
                let blinded_a = suite.blind(input, &key_a).unwrap();
                let blinded_b = suite.blind(input, &key_b).unwrap();
                let double_ab = suite.evaluate(&blinded_a, &key_b).unwrap();
                let double_ba = suite.evaluate(&blinded_b, &key_a).unwrap();
                assert_eq!(
                    hex::encode(&double_ab),
                    hex::encode(&double_ba),
                    "{curve:?} double blinding must commute"
                );
                assert_eq!(double_ab.len(), POINT_SIZE);
            }
        }
    }

    #[test]
    fn distinct_inputs_do_not_collide() {
        let suite = EcdhSuite::new(EccCurve::Ed25519, HashAlg::Sha512).unwrap();
        let key = suite.random_scalar();
        let a = suite.blind(b"alice", &key).unwrap();
        let b = suite.blind(b"bob", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn every_backed_hash_produces_valid_points() {
        for hash in [HashAlg::Sha256, HashAlg::Sha512, HashAlg::Blake2b, HashAlg::Md5] {
            let suite = EcdhSuite::new(EccCurve::Ed25519, hash).unwrap();
            let key = suite.random_scalar();
            let blinded = suite.blind(b"payload", &key).unwrap();
            // the result is a decodable point
            assert!(suite.evaluate(&blinded, &key).is_ok(), "{hash:?}");
        }
    }

    #[test]
    fn unbacked_algorithms_are_rejected() {
        assert!(EcdhSuite::new(EccCurve::Sm2, HashAlg::Sha256).is_err());
        assert!(EcdhSuite::new(EccCurve::P256, HashAlg::Sha256).is_err());
        assert!(EcdhSuite::new(EccCurve::Ed25519, HashAlg::Sm3).is_err());
    }

    #[test]
    fn suite_selection_prefers_first_common() {
        let config = PsiConfig::default();
        let (curve, hash) = select_suite(
            &config,
            &[EccCurve::P256 as i8, EccCurve::Ed25519 as i8],
            &[HashAlg::Sha512 as i8, HashAlg::Sha256 as i8],
        );
        assert_eq!(curve, Some(EccCurve::Ed25519));
        assert_eq!(hash, Some(HashAlg::Sha512));
    }

    #[test]
    fn suite_selection_fails_without_common_algorithm() {
        let config = PsiConfig::default();
        let (curve, hash) = select_suite(&config, &[EccCurve::Sm2 as i8], &[HashAlg::Sm3 as i8]);
        assert_eq!(curve, None);
        assert_eq!(hash, None);
    }
}
