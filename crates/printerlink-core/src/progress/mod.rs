//! Print progress estimation

pub mod eta;

pub use eta::{fmt_hms, parse_m27, Clock, EtaEstimator, EtaReport, ManualClock, SystemClock};
