//! Diffie-Hellman key agreement used to key the secure channel.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use sha1::{Digest, Sha1};

use crate::{error::AuthFailure, utils::Result};

/// 1024-bit MODP group of RFC 2409 (Oakley group 2).
const GROUP2_PRIME: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
    FFFFFFFFFFFFFFFF";

/// Shared group parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhParams {
    pub generator: BigUint,
    pub modulus: BigUint,
}

impl Default for DhParams {
    fn default() -> Self {
        DhParams {
            generator: BigUint::from(2u32),
            modulus: BigUint::parse_bytes(GROUP2_PRIME.as_bytes(), 16).unwrap_or_default(),
        }
    }
}

impl DhParams {
    /// Start one exchange with a fresh private exponent.
    pub fn exchange(&self) -> Exchange {
        let private = BigUint::from_bytes_be(&rand::random::<[u8; 32]>());
        let public = self.generator.modpow(&private, &self.modulus);
        Exchange {
            params: self.clone(),
            private: Some(private),
            public,
        }
    }
}

/// One side of a key agreement. The private exponent is consumed by
/// [`Exchange::agree`].
#[derive(Debug)]
pub struct Exchange {
    params: DhParams,
    private: Option<BigUint>,
    public: BigUint,
}

impl Exchange {
    /// Our public value, big-endian.
    pub fn public(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Shared value from the peer's public value.
    pub fn agree(&mut self, peer: &[u8]) -> Result<Vec<u8>> {
        let private = self
            .private
            .take()
            .ok_or_else(|| AuthFailure::Negotiation("key agreement already used".into()))?;
        let peer = BigUint::from_bytes_be(peer);
        let top = &self.params.modulus - BigUint::one();
        if peer.is_zero() || peer.is_one() || peer >= top {
            return Err(AuthFailure::Negotiation("bad public value".into()).into());
        }
        Ok(peer.modpow(&private, &self.params.modulus).to_bytes_be())
    }
}

/// Channel secret from the ticket key and the agreed value.
pub fn derive_secret(ticket_key: &[u8], shared: &[u8]) -> Vec<u8> {
    let mut h = Sha1::new();
    h.update(ticket_key);
    h.update(shared);
    h.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_two() {
        let p = DhParams::default();
        assert_eq!(p.modulus.bits(), 1024);
        assert_eq!(p.generator, BigUint::from(2u32));
    }

    #[test]
    fn both_sides_agree() {
        let params = DhParams::default();
        let mut a = params.exchange();
        let mut b = params.exchange();
        let (pa, pb) = (a.public(), b.public());
        let sa = a.agree(&pb).unwrap();
        let sb = b.agree(&pa).unwrap();
        assert_eq!(sa, sb);
        assert_eq!(derive_secret(b"kkkkkkk", &sa).len(), 20);
        assert!(a.agree(&pb).is_err());
    }

    #[test]
    fn degenerate_public_values() {
        let params = DhParams {
            generator: BigUint::from(5u32),
            modulus: BigUint::from(23u32),
        };
        let mut x = params.exchange();
        assert!(x.agree(&[1]).is_err());
        let mut x = params.exchange();
        assert!(x.agree(&[22]).is_err());
        let mut x = params.exchange();
        assert!(x.agree(&[8]).is_ok());
    }
}
