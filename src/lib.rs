//! Purpose: Library crate behind the `colserve` binary: query core plus the public API surface.
//! Exports: `core` (predicates, scans, encoding, errors) and `api` (stable re-exports).
//! Role: Shared by the CLI, the HTTP server and integration tests.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
