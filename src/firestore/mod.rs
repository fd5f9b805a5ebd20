//! Firestore REST access for pet and family documents.

mod client;
mod value;

pub use client::FirestoreClient;
