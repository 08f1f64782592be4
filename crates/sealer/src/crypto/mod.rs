//! Cryptographic primitives over a certificate's key pair.
//!
//! Everything here is synchronous and free of persistence concerns. Callers
//! pass the [`CertificateBody`](crate::keys::CertificateBody) holding the
//! key material explicitly.
//!
//! These primitives preserve the shape of small-integer modular arithmetic.
//! They do **not** provide real-world cryptographic strength; size the
//! modulus accordingly for anything beyond demonstration.

pub mod arith;
pub mod canonical;
pub mod cipher;
pub mod integrity;
pub mod signature;

pub use integrity::IntegrityMode;
