mod apply_test;
mod pipeline_test;
