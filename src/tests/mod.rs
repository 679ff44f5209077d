// Test modules

pub mod common;

mod pipeline_flow_test;
mod processor_test;
