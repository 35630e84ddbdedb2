//! Shared primitives for the partition workspace: identifiers, transforms,
//! bounding volumes, streaming shapes and generation-stamped handles.

pub mod bounds;
pub mod handle;
pub mod shape;
pub mod types;

pub use bounds::Aabb;
pub use handle::{Arena, Handle};
pub use shape::StreamingShape;
pub use types::{ActorId, ProviderId, Transform};
