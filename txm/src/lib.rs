pub mod alerts;
pub mod attempt_builder;
pub mod broadcaster;
pub mod config;
pub mod confirmer;
pub mod error;
pub mod error_classifier;
pub mod finalizer;
pub mod head;
pub mod lifecycle;
pub mod nonce;
pub mod resender;
pub mod store;
pub mod stuck_detector;
pub mod types;

pub use head::Head;
pub use lifecycle::{ShutdownHandle, Txm, TxRequest, WorkerHandle};
pub use types::{Tx, TxAttempt, TxId, TxState};
