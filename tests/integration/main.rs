//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that drives the comm loop against mock
//! adapters.  All tests run on the host (x86_64) with no CAN controller
//! required.

mod app_service_tests;
mod mock_hw;
