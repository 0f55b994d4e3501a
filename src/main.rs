use anyhow::Context;
use clap::Parser;
use iq_slurper::{
    args::{convert_filter, Args},
    control::StopSignal,
    housekeeping::KernelCache,
    pipeline::run_capture,
    sched::{platform_scheduler, probe_realtime},
    sim::SimulatedRadio,
};
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();
    info!("Starting iq slurper!");

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            if stop.request() {
                warn!("Interrupted, finishing up");
            }
        })
        .context("Error setting Ctrl-C handler")?;
    }

    let scheduler = platform_scheduler();
    probe_realtime(scheduler.as_ref());

    let radio = SimulatedRadio::from_args(&args.device_args)
        .with_context(|| format!("Opening device with `{}`", args.device_args))?;
    let config = args.capture_config();
    let summary = run_capture(radio, &config, stop, scheduler, KernelCache)
        .context("Capture failed")?;
    summary.log();
    if !summary.is_complete() {
        warn!("Capture ended early");
    }
    Ok(())
}
