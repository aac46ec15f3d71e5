//! One-line import for the common surface.
//!
//! ```rust
//! use modelherd::prelude::*;
//! ```

pub use crate::bus::{InMemoryBus, MessageBus};
pub use crate::config::CoreConfig;
pub use crate::controller::{Controller, LifecycleState, StreamEvent, TokenStream};
pub use crate::error::InferenceError;
pub use crate::events::ControlEvent;
pub use crate::protocol::{InferenceRequest, Priority, ResponseEvent, Token};
pub use crate::streaming::{Chunk, ChunkConsumer};
