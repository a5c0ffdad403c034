//! Load-balancing data contracts.
//!
//! Only the shape of a bundle split lives here. Deciding when to split and
//! where the children go belongs to the load manager.

mod service_unit;
mod split;

pub use service_unit::ServiceUnitId;
pub use split::{Split, SplitBuilder, SplitDestinations};
