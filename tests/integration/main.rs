//! Integration test driver for `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that exercises a subsystem against mock
//! transports. All tests run on the host with no instruments attached.

mod controller_tests;
mod mock_links;
mod sequencer_tests;
