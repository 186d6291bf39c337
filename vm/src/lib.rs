//! Driver library behind the `vm` binary: heap stress runs and control
//! flow dumps of sample methods.

pub mod cfg;
pub mod stress;

pub use cfg::dump_method;
pub use stress::{StressOptions, StressReport, run as run_stress};
