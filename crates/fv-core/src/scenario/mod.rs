//! Declarative scenarios: a topology plus an ordered list of steps, loaded
//! from TOML and run to a serialisable report.

pub mod format;
pub mod parser;
pub mod runner;

pub use format::{ScenarioToml, Step, WatchSpec};
pub use parser::{ScenarioParseError, load_scenario, parse_scenario};
pub use runner::{ScenarioError, ScenarioReport, StepOutcome, StepReport, run_scenario};
