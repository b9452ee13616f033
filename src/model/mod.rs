//! # Property Graph Model
//!
//! Clean DTOs that define the property graph. These types cross every
//! boundary: storage ↔ planner ↔ execution ↔ wire protocols.
//!
//! Design rule: this module is pure data — no I/O, no state, no async.

pub mod node;
pub mod path;
pub mod property_map;
pub mod relationship;
pub mod value;

pub use node::{Node, NodeId};
pub use path::Path;
pub use property_map::PropertyMap;
pub use relationship::{Direction, RelId, Relationship};
pub use value::Value;
