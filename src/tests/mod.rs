#![cfg(test)]

mod bus_test;
mod errors_test;
mod router_test;
mod sse_test;
mod static_files_test;
