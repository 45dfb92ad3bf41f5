//! ternd, the tern media driver daemon.
//!
//! Configuration comes from the environment (see `tern_driver::context`);
//! the conductor runs on this thread with the configured idle strategy
//! until SIGINT or a validated TERMINATE_DRIVER command.

use std::sync::atomic::{AtomicBool, Ordering};

use tern_driver::{DriverConductor, DriverContext};
use tern_primitives::Idler;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut ctx = DriverContext::from_env();
    ctx.dir_delete_on_start = true;

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    let mut conductor = match DriverConductor::launch(ctx) {
        Ok(conductor) => conductor,
        Err(e) => {
            eprintln!("ternd: failed to launch: {e}");
            std::process::exit(1);
        }
    };

    let mut idler = Idler::new(conductor.context().conductor_idle_strategy.clone());

    while RUNNING.load(Ordering::Acquire) && !conductor.is_terminating() {
        let work_count = conductor.do_work();
        idler.idle(work_count);
    }

    tracing::info!("ternd shutting down");
}
