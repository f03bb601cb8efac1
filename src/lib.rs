pub mod backend;
pub mod errors;
pub mod filesystem;
pub mod model;
pub mod progress;
pub mod remote;
pub mod transfer;
pub mod tree;
