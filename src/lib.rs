pub mod bus;
pub mod config;
pub mod gamble_queue;
pub mod logging;
pub mod models;
pub mod services;
pub mod slots;
pub mod storage;
pub mod supervisor;
pub mod workers;
