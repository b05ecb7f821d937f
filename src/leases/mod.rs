// Lease coordination for a fleet of identical processes
//
// Each process runs one `LeaseManager`. The cluster hash ring names the
// designated owner of every resource, and that process backs its claim with an
// ephemeral node in the coordination service:
// - `Lease::check_held` converges local status with the node and the ring
// - ownership moves by releasing the node when the ring points elsewhere
// - disconnects reset status to unknown until the node is re-verified

pub mod lease;
pub mod manager;
pub mod state;

pub use lease::Lease;
pub use manager::LeaseManager;
pub use state::{LeaseStatus, Lifecycle};
