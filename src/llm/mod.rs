pub mod router;

pub use router::{ModelRouter, ModelRouterSerde, SuspensionStore};
