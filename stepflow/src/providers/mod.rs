//! Provider implementations
//!
//! One remote backend (Gemini over HTTPS) and offline simulated backends
//! standing in for vendors that are not wired up yet. All of them obey the
//! same [`stepflow_sdk::Provider`] contract and timing shape; the engine
//! cannot tell them apart.

pub mod gemini;
pub mod simulated;

pub use gemini::GeminiProvider;
pub use simulated::SimulatedProvider;
