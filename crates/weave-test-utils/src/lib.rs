//! Mock handlers and fixtures shared by Weave tests.

pub mod agents;
pub mod fixtures;

pub use agents::{CountingAgent, EchoAgent, FailingAgent, FlakyAgent, RecordingAgent, SlowAgent};
pub use fixtures::{count_where, drain, write_config};
