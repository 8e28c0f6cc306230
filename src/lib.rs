pub mod guardrail;
pub mod http;
pub mod json;
pub mod jsonpath;
pub mod llm;
pub mod policy;
pub mod ratelimit;
pub mod semantic;
pub mod serdes;
pub mod strng;

pub use std::collections::HashMap;
pub use std::fmt::{Debug, Display};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant, SystemTime};

pub use anyhow::Context as _;
pub use bytes::Bytes;
pub use serde::{Deserialize, Serialize, Serializer};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::serdes::*;
pub use crate::strng::Strng;
