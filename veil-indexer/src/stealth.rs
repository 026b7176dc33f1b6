// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ERC-5564 stealth address derivation over secp256k1.
//!
//! The recipient holds a spending public key and a viewing private key. For
//! an announcement carrying ephemeral public key `R`:
//!
//!   S  = viewing_priv * R          (ECDH shared secret)
//!   h  = keccak256(compress(S))
//!   P' = spending_pub + h * G
//!   stealth address = keccak256(uncompress(P')[1..])[12..]
//!
//! The first byte of `h` is the view tag, published in the announcement
//! metadata so non-matching announcements can be rejected after a single
//! scalar multiplication instead of three.

use ethers::core::k256::elliptic_curve::ops::Reduce;
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::core::k256::{FieldBytes, ProjectivePoint, PublicKey, Scalar, SecretKey};
use ethers::types::Address;
use ethers::utils::keccak256;

use crate::error::{IndexerError, IndexerResult};

/// Scheme id assigned to secp256k1-with-view-tags by ERC-5564.
pub const SCHEME_ID_SECP256K1: u64 = 1;

/// Recipient-side key material for one user.
#[derive(Debug, Clone)]
pub struct StealthKeys {
    spending_pub: PublicKey,
    viewing_priv: SecretKey,
}

/// Result of a successful stealth derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealthDerivation {
    pub address: Address,
    pub view_tag: u8,
}

impl StealthKeys {
    pub fn from_bytes(spending_pub: &[u8], viewing_priv: &[u8]) -> IndexerResult<Self> {
        let spending_pub = PublicKey::from_sec1_bytes(spending_pub)
            .map_err(|e| IndexerError::DecodeError(format!("bad spending pub key: {}", e)))?;
        let viewing_priv = SecretKey::from_slice(viewing_priv)
            .map_err(|e| IndexerError::DecodeError(format!("bad viewing priv key: {}", e)))?;
        Ok(Self {
            spending_pub,
            viewing_priv,
        })
    }

    /// Derives the stealth address this user would own for `ephemeral_pub`.
    pub fn derive(&self, ephemeral_pub: &[u8]) -> IndexerResult<StealthDerivation> {
        let ephemeral = PublicKey::from_sec1_bytes(ephemeral_pub)
            .map_err(|e| IndexerError::DecodeError(format!("bad ephemeral pub key: {}", e)))?;

        let shared = ephemeral.to_projective() * *self.viewing_priv.to_nonzero_scalar();
        let (tweak, view_tag) = hash_to_scalar(&shared);

        let stealth_point = self.spending_pub.to_projective() + ProjectivePoint::GENERATOR * tweak;
        Ok(StealthDerivation {
            address: point_to_address(&stealth_point),
            view_tag,
        })
    }

    /// Trial-derives against one announcement. Returns `None` when the view
    /// tag from the metadata rejects it, which costs only the shared-secret
    /// computation and rejects ~255/256 of foreign announcements; otherwise
    /// returns the derived address for the caller to compare.
    pub fn scan(&self, ephemeral_pub: &[u8], view_tag: u8) -> IndexerResult<Option<Address>> {
        let ephemeral = PublicKey::from_sec1_bytes(ephemeral_pub)
            .map_err(|e| IndexerError::DecodeError(format!("bad ephemeral pub key: {}", e)))?;

        let shared = ephemeral.to_projective() * *self.viewing_priv.to_nonzero_scalar();
        let (tweak, derived_tag) = hash_to_scalar(&shared);
        if derived_tag != view_tag {
            return Ok(None);
        }

        let stealth_point = self.spending_pub.to_projective() + ProjectivePoint::GENERATOR * tweak;
        Ok(Some(point_to_address(&stealth_point)))
    }

    pub fn matches_announcement(
        &self,
        ephemeral_pub: &[u8],
        view_tag: u8,
        stealth_address: &[u8],
    ) -> IndexerResult<bool> {
        Ok(self
            .scan(ephemeral_pub, view_tag)?
            .map_or(false, |addr| addr.as_bytes() == stealth_address))
    }

    /// Address of the user's root spending key.
    pub fn signer_address(&self) -> Address {
        point_to_address(&self.spending_pub.to_projective())
    }
}

/// Extracts the view tag from ERC-5564 announcement metadata. The tag is
/// the first metadata byte; empty metadata is malformed.
pub fn view_tag_from_metadata(metadata: &[u8]) -> IndexerResult<u8> {
    metadata
        .first()
        .copied()
        .ok_or_else(|| IndexerError::DecodeError("announcement metadata is empty".to_string()))
}

fn hash_to_scalar(shared: &ProjectivePoint) -> (Scalar, u8) {
    let compressed = shared.to_affine().to_encoded_point(true);
    let hash = keccak256(compressed.as_bytes());
    let tweak = <Scalar as Reduce<ethers::core::k256::U256>>::reduce_bytes(
        FieldBytes::from_slice(&hash),
    );
    (tweak, hash[0])
}

fn point_to_address(point: &ProjectivePoint) -> Address {
    let uncompressed = point.to_affine().to_encoded_point(false);
    // Skip the 0x04 SEC1 prefix; the address is the low 20 bytes of the hash.
    let hash = keccak256(&uncompressed.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Sender-side half of the scheme: picks a fresh ephemeral key and derives
/// the announcement fields a payer would publish for this recipient.
pub fn prepare_stealth_payment(
    spending_pub: &[u8],
    viewing_pub: &[u8],
    ephemeral_priv: &SecretKey,
) -> IndexerResult<(StealthDerivation, Vec<u8>)> {
    let spending = PublicKey::from_sec1_bytes(spending_pub)
        .map_err(|e| IndexerError::DecodeError(format!("bad spending pub key: {}", e)))?;
    let viewing = PublicKey::from_sec1_bytes(viewing_pub)
        .map_err(|e| IndexerError::DecodeError(format!("bad viewing pub key: {}", e)))?;

    let shared = viewing.to_projective() * *ephemeral_priv.to_nonzero_scalar();
    let (tweak, view_tag) = hash_to_scalar(&shared);
    let stealth_point = spending.to_projective() + ProjectivePoint::GENERATOR * tweak;

    let ephemeral_pub = ephemeral_priv
        .public_key()
        .to_encoded_point(true)
        .as_bytes()
        .to_vec();
    Ok((
        StealthDerivation {
            address: point_to_address(&stealth_point),
            view_tag,
        },
        ephemeral_pub,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Recipient {
        keys: StealthKeys,
        spending_pub: Vec<u8>,
        viewing_pub: Vec<u8>,
    }

    fn recipient(rng: &mut StdRng) -> Recipient {
        let spending_priv = SecretKey::random(rng);
        let viewing_priv = SecretKey::random(rng);
        let spending_pub = spending_priv
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();
        let viewing_pub = viewing_priv
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();
        let keys = StealthKeys::from_bytes(&spending_pub, &viewing_priv.to_bytes()).unwrap();
        Recipient {
            keys,
            spending_pub,
            viewing_pub,
        }
    }

    #[test]
    fn test_sender_and_recipient_derive_the_same_address() {
        let mut rng = StdRng::seed_from_u64(7);
        let r = recipient(&mut rng);
        let ephemeral_priv = SecretKey::random(&mut rng);

        let (sent, ephemeral_pub) =
            prepare_stealth_payment(&r.spending_pub, &r.viewing_pub, &ephemeral_priv).unwrap();
        let derived = r.keys.derive(&ephemeral_pub).unwrap();

        assert_eq!(sent, derived);
        assert!(r
            .keys
            .matches_announcement(&ephemeral_pub, sent.view_tag, sent.address.as_bytes())
            .unwrap());
    }

    #[test]
    fn test_foreign_announcement_does_not_match() {
        let mut rng = StdRng::seed_from_u64(8);
        let alice = recipient(&mut rng);
        let bob = recipient(&mut rng);
        let ephemeral_priv = SecretKey::random(&mut rng);

        // Payment addressed to alice must not match bob's keys even when
        // bob skips the view-tag prefilter by reusing the announced tag.
        let (sent, ephemeral_pub) =
            prepare_stealth_payment(&alice.spending_pub, &alice.viewing_pub, &ephemeral_priv)
                .unwrap();
        let bob_derivation = bob.keys.derive(&ephemeral_pub).unwrap();
        assert_ne!(bob_derivation.address, sent.address);
        assert!(!bob
            .keys
            .matches_announcement(&ephemeral_pub, bob_derivation.view_tag, sent.address.as_bytes())
            .unwrap());
    }

    #[test]
    fn test_wrong_view_tag_short_circuits() {
        let mut rng = StdRng::seed_from_u64(9);
        let r = recipient(&mut rng);
        let ephemeral_priv = SecretKey::random(&mut rng);

        let (sent, ephemeral_pub) =
            prepare_stealth_payment(&r.spending_pub, &r.viewing_pub, &ephemeral_priv).unwrap();
        let wrong_tag = sent.view_tag.wrapping_add(1);
        assert!(!r
            .keys
            .matches_announcement(&ephemeral_pub, wrong_tag, sent.address.as_bytes())
            .unwrap());
    }

    #[test]
    fn test_metadata_view_tag() {
        assert_eq!(view_tag_from_metadata(&[0xab, 0x01, 0x02]).unwrap(), 0xab);
        view_tag_from_metadata(&[]).unwrap_err();
    }

    #[test]
    fn test_malformed_keys_are_decode_errors() {
        let err = StealthKeys::from_bytes(&[0x02; 3], &[0x11; 32]).unwrap_err();
        assert_eq!(err.error_type(), "decode_error");
    }
}
