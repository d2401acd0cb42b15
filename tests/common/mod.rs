use std::future::Future;

use captains_log::*;

/// Shared runtime + logger rig for the e2e tests.
pub struct TestRig {
    rt: tokio::runtime::Runtime,
}

impl TestRig {
    pub fn new() -> Self {
        let _ = recipe::raw_file_logger("/tmp/value_rpc_test.log", Level::Trace).test().build();
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}
