//! Driftbox Ingest
//!
//! Turns the agent's raw stdout into typed events: reassembles byte chunks
//! into lines, parses each line against the closed `AgentEvent` union, and
//! scans event content for the dev-server preview URL.
//!
//! Everything here is pure — no IO, no async. The server feeds chunks in
//! and persists what comes out.

pub mod event;
pub mod line;
pub mod url;

pub use event::parse_line;
pub use line::LineAssembler;
pub use url::find_preview_url;
