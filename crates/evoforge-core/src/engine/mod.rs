pub mod controller;
pub mod repair;
pub mod selector;

pub use controller::{open_run, ControllerSettings, EvolutionController, EvolveSummary};
