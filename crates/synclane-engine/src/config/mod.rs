pub mod flags;
pub mod parser;
pub mod types;
pub mod validator;

pub use flags::{FeatureFlagClient, Flag, FlagContext, FlagValue, ReplicationFeatureFlags, StaticFlagClient};
pub use types::{NamespaceDefinition, SyncConfig};
