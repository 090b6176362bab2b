mod mocks;

mod listener_tests;
mod server_tests;
