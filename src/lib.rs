//! Purpose: Client library for driving a Tenzir node through its control program.
//! Exports: `api` (client, export sessions, tables), `core` (errors, endpoints,
//!          command building, process driver, stream decoding).
//! Role: Library backing the `tenzir-client` CLI and embedding applications.
//! Invariants: Every engine interaction runs as a child process that the
//!             crate owns and tears down.
//! Invariants: Results stream incrementally; nothing buffers a whole export
//!             unless the caller asks for tables.
pub mod api;
pub mod core;
