mod test_run;

pub use test_run::{ProcessTestRunJob, process_test_run_job};
