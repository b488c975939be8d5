//! Request identities presented by the fetcher.

pub mod fingerprint;

pub use fingerprint::FingerprintManager;
