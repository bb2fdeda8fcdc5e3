//! The forwarding core
//!
//! Everything a call touches on its way through the relay: the opaque codec,
//! the backend connection pool, the director that picks a backend, the stream
//! handler that pumps frames both ways, and the serving glue.

pub mod codec;
pub mod director;
pub mod handler;
pub mod pool;
pub mod server;
