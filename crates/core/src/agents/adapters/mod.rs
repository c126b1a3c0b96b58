//! Agent adapter implementations.

pub mod mock_agent;
pub mod print_agent;

pub use mock_agent::MockAgent;
pub use print_agent::PrintAgent;
