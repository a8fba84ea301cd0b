//! Response parsing and dispatch
//!
//! - `parser`: stateless line parsers
//! - `sd`: SD listing and progress tracking
//! - `dispatcher`: precedence rules and cached snapshots

pub mod dispatcher;
pub mod parser;
pub mod sd;

pub use dispatcher::{DispatchEvent, ResponseDispatcher};
pub use parser::{extract_m115_kv, parse_position, parse_temperature};
pub use sd::{parse_file_list, SdProgressTracker};
