//! Common test utilities shared by the integration tests.
//!
//! - Fixtures (settings, emulated printers, G-code programs)
//! - Custom assertions over workflows and event streams
//! - Mock agents that need test-side control

pub mod assertions;
pub mod fixtures;
pub mod mock_agents;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use mock_agents::*;
