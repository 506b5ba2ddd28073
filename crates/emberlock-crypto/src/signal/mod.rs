pub mod memory_stores;
pub mod prekeys;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod x3dh;

pub use memory_stores::{MemoryIdentityStore, MemoryPreKeyStore, StaticCompromiseDetector};
pub use prekeys::{OneTimePreKey, PreKeyBundle, SignedPreKey};
pub use ratchet::{DoubleRatchetState, MessageHeader, Role};
pub use session::{SessionConfig, SignalSession};
pub use store::{CompromiseDetector, IdentityKeyStore, PreKeyStore};
pub use x3dh::InitialMessage;
