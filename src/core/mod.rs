// Core modules: errors, command building, process driving, and decoding.
pub mod decode;
pub mod endpoint;
pub mod error;
pub mod invocation;
pub mod predicate;
pub mod process;
