pub mod chain;
pub mod error;
pub mod fee;
pub mod signer;
