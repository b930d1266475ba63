/// The signature-verification capability the core takes as an input. No
/// concrete cryptographic primitive lives in this crate; callers plug in
/// their key/signature scheme of choice.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, pubkey: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool;
}

/// A verifier that accepts every signature. Only for tests and fixtures —
/// never wire this into a running validator.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify(&self, _pubkey: &[u8; 32], _message: &[u8], _signature: &[u8; 64]) -> bool {
        true
    }
}
