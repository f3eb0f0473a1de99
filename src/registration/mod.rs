//! Ephemeral, self-healing key registrations.
//!
//! A [`NodeRegistration`] keeps one key alive in the store for as long as it
//! runs: it grants a lease, writes the key bound to it, renews the lease and
//! watches the key. Losing the lease or the key starts a new attempt; another
//! writer re-creating the key makes the attempt step aside and re-claim it.
//! Teardown only deletes the key while it still carries the creation revision
//! captured by the attempt that wrote it.

mod node_registration;
mod state;

pub use node_registration::*;
pub use state::*;

#[cfg(test)]
mod node_registration_test;
