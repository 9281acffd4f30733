// ABOUTME: Clock synchronization between client and server
// ABOUTME: Home of the shared TimeProvider handle

pub mod clock;

pub use clock::TimeProvider;
