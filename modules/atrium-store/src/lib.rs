//! Persistence contracts for the analysis/notification core, plus the two
//! implementations: Postgres (production) and in-memory (tests and local
//! wiring). The core never touches a pool directly — everything goes
//! through the traits.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{MemoryCheckpointCache, MemoryStore, StaticPersonaDirectory};
pub use postgres::PgStore;
pub use traits::{
    ActivityLog, CheckpointCache, DiscoveryStore, NotificationStore, NotificationUpsert,
    PersonaDirectory, PointStore, StateStore,
};
