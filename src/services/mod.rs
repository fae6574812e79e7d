//! The three ChatManager microservices. Each is a single-threaded
//! cooperative poll loop owned by its own OS process; they share no memory,
//! only the bus directory.

pub mod emitter;
pub mod ingestor;
pub mod router_bank;
