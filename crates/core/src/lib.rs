//! Settings shared by the `batchflow` engine and command-line runner.

pub mod settings;
