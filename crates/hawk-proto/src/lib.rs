pub mod command;
pub mod report;
pub mod telemetry;
