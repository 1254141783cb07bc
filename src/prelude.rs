pub use crate::engine::{
    LeveledCache, ModifyAllParams, ModifyParams, MutatingCache, TierRef,
};
pub use crate::error::{ConfigError, DynError, ModifyError, StoreError};
pub use crate::tier::ClockTier;
pub use crate::traits::{MutateCache, Tier, TierMetrics};
pub use crate::versioned::{
    MemoryStore, Operation, OptimisticStore, PrefixGroupCache, StoreRequest, VersionIndexCache,
    VersionedRecord,
};
