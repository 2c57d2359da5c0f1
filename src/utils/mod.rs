pub mod bed;
pub mod command;
pub mod file;
pub mod pairing;
pub mod progress;
pub mod streams;
pub mod system;
