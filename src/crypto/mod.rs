//! Cryptographic building blocks: key derivation, keyfile mixing and the
//! XTS sector codec.

pub mod kdf;
pub mod keyfile;
pub mod xts;
