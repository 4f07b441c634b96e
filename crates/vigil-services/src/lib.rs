//! vigil-services — peer state shared between the daemon's subsystems:
//! reputation scores, vote-agreement history, the partner list, and rate
//! limiting.

pub mod agreement;
pub mod limiter;
pub mod partner;
pub mod reputation;

pub use agreement::{AgreementRecord, AgreementTracker};
pub use limiter::RateLimiter;
pub use partner::PartnerList;
pub use reputation::{ReputationEvent, ReputationTable, INITIAL_REPUTATION, MAX_REPUTATION};

/// Persistence collaborator. The daemon stores peer state as opaque blobs;
/// the on-disk layout belongs to whoever implements this.
pub trait PeerStateStore: Send + Sync {
    fn load(&self, key: &str) -> std::io::Result<Option<Vec<u8>>>;
    fn store(&self, key: &str, blob: &[u8]) -> std::io::Result<()>;
}
