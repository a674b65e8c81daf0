//! EIP-712 `Permit` typed data and signature recovery.
//!
//! A permit authorizes the relayer to move tokens on the owner's behalf. It
//! is signed off-chain over the token's EIP-712 domain and verified here by
//! recovering the signer address from the 65-byte `r || s || v` signature.

use alloy_primitives::{Address, B256, Signature, U256};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain, sol};

sol! {
    /// Transfer authorization signed by the token owner.
    struct Permit {
        address owner;
        address receiver;
        uint256 value;
        uint256 nonce;
        uint256 deadline;
    }
}

/// EIP-712 domain of the permit token. The domain version is fixed to `"1"`.
#[derive(Debug, Clone)]
pub struct PermitDomain {
    /// Token contract's EIP-712 domain name.
    pub name: String,
    /// Chain id the token is deployed on.
    pub chain_id: u64,
    /// Address of the token contract.
    pub verifying_contract: Address,
}

impl PermitDomain {
    fn eip712(&self) -> Eip712Domain {
        eip712_domain! {
            name: self.name.clone(),
            version: "1",
            chain_id: self.chain_id,
            verifying_contract: self.verifying_contract,
        }
    }
}

/// Errors from verifying a permit signature.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// The signature is not exactly 65 bytes.
    #[error("invalid signature length: {0}")]
    InvalidLength(usize),
    /// The trailing recovery byte is not 27 or 28.
    #[error("invalid recovery id: {0}")]
    InvalidRecoveryId(u8),
    /// secp256k1 recovery over the digest failed.
    #[error("signature recovery failed: {0}")]
    Recovery(#[from] alloy_primitives::SignatureError),
}

/// Computes the EIP-712 signing hash of a permit:
/// `keccak256(0x19 || 0x01 || domainSeparator || structHash)`.
#[must_use]
pub fn signing_hash(domain: &PermitDomain, permit: &Permit) -> B256 {
    permit.eip712_signing_hash(&domain.eip712())
}

/// Recovers the address that signed `permit` over `domain`.
///
/// Accepts only 65-byte signatures with a recovery byte of 27 or 28. The
/// caller's buffer is never modified.
///
/// # Errors
///
/// Returns [`SignatureError`] if the signature is malformed or recovery
/// fails.
pub fn verify_signature(
    domain: &PermitDomain,
    permit: &Permit,
    signature: &[u8],
) -> Result<Address, SignatureError> {
    if signature.len() != 65 {
        return Err(SignatureError::InvalidLength(signature.len()));
    }
    let v = signature[64];
    if v != 27 && v != 28 {
        return Err(SignatureError::InvalidRecoveryId(v));
    }

    let r = U256::from_be_slice(&signature[..32]);
    let s = U256::from_be_slice(&signature[32..64]);
    let signature = Signature::new(r, s, v == 28);

    let digest = signing_hash(domain, permit);
    Ok(signature.recover_address_from_prehash(&digest)?)
}
