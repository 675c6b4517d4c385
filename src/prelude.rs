pub use std::{
    sync::Arc,
    time::Duration,
};

pub use anyhow::{anyhow, Context, Result};
#[allow(unused)]
pub use tracing::{debug, error, info, warn};
pub use serde::{Deserialize, Serialize};

pub use coord::{InstanceCrashEvent, NodeId};
