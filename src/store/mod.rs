//! Application data stores.
//!
//! Each store owns its state in a `watch` channel: mutations go through the
//! store and every subscriber sees the new snapshot.

mod family;
mod pets;
mod source;

pub use family::{FamilyStore, SessionState};
pub use pets::{PetState, PetStore};
pub use source::{FamilySource, PetSource};
