//! Hypercall handlers.
//!
//! Each module owns a group of hypercalls and the host resource behind
//! them.  Block and network backends are traits so the same handlers run
//! against files and tap devices or against in-memory fixtures.

pub mod block;
pub mod console;
pub mod lifecycle;
pub mod net;

pub use block::{BlockModule, FileDisk, MemDisk, Storage};
pub use console::ConsoleModule;
pub use lifecycle::LifecycleModule;
pub use net::{NetBackend, NetModule, QueueNet, Tap};
