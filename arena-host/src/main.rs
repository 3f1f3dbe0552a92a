//! arena-run - execute a trial protocol on an LED arena

use std::fs;

use anyhow::{Context, Result};
use arena_core::config::ProtocolDescription;
use arena_core::traits::{Clock, SimulatedClock, SystemClock};
use arena_host::logging::init_logging;
use arena_host::{
    load_trial_order, ArenaLink, Cli, PluginRegistry, RunOptions, SchedulerOptions,
    TrialScheduler,
};
use clap::Parser;
use tracing::{error, info};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let options = cli.options().context("invalid run options")?;
    init_logging(&options.verbosity).context("failed to initialise logging")?;

    let text = fs::read_to_string(&cli.protocol)
        .with_context(|| format!("failed to read {}", cli.protocol.display()))?;
    let protocol = ProtocolDescription::from_toml_str(&text)
        .with_context(|| format!("failed to parse {}", cli.protocol.display()))?;

    if options.dry_run {
        info!("Dry run: simulated arena, virtual time");
        run(&options, &protocol, SimulatedClock::new())
    } else {
        run(&options, &protocol, SystemClock::new())
    }
}

fn run<C: Clock>(options: &RunOptions, protocol: &ProtocolDescription, clock: C) -> Result<()> {
    let replay = match &options.replay {
        Some(path) => Some(
            load_trial_order(path)
                .with_context(|| format!("failed to load trial order {}", path.display()))?,
        ),
        None => None,
    };

    let mut plugins =
        PluginRegistry::from_specs(&options.plugins).context("invalid plugin definition")?;
    plugins.set_dry_run(options.dry_run);

    let endpoint = options.endpoint()?;
    info!("Arena endpoint: {}", endpoint);
    let link = ArenaLink::new(endpoint, options.link_config());

    let mut scheduler = TrialScheduler::new(
        link,
        plugins,
        clock,
        SchedulerOptions {
            seed: options.seed,
            replay,
            flush_responses: options.flush_responses,
        },
    );

    match scheduler.run(protocol, &options.output_dir) {
        Ok(report) => {
            println!("{}", report.summary);
            println!("artifacts: {}", report.directory.path().display());
            Ok(())
        }
        Err(err) => {
            error!("{}", err);
            Err(err.into())
        }
    }
}
