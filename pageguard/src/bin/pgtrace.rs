use std::{
    fs::{File, OpenOptions},
    path::PathBuf,
    ptr::NonNull,
    time::Instant,
};

use clap::{Parser, Subcommand};
use human_bytes::human_bytes;
use itertools::Itertools;
use log::info;
use rand::Rng;

use pageguard::{
    features::show_features, statistics::as_text, write_watch::WriteWatchType, Error, PageGuardConfig,
    PageGuardManager, Result,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct CliArgs {
    /// File to write logs to.
    #[arg(long)]
    log_output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which tracking mechanisms work on this host.
    Features,

    /// Dirty random pages of a region and drain them.
    Bench {
        /// YAML file with a page guard configuration.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Track the region in place instead of through a shadow copy.
        #[arg(long)]
        direct: bool,

        /// Write-watch backend used in direct mode.
        #[arg(long)]
        write_watch: Option<WriteWatchType>,

        /// Region size in bytes.
        #[arg(long, default_value_t = 64 << 20)]
        size: usize,

        /// Number of random writes per iteration.
        #[arg(long, default_value_t = 1000)]
        writes: usize,

        /// Number of write-then-drain iterations.
        #[arg(long, default_value_t = 10)]
        iterations: usize,

        /// Dump statistics.
        #[arg(long)]
        dump_stats: bool,
    },
}

fn load_config(path: Option<PathBuf>, direct: bool) -> Result<PageGuardConfig> {
    let mut config = match path {
        Some(path) => PageGuardConfig::from_yaml_reader(File::open(path)?)?,
        None => PageGuardConfig::default(),
    };

    if direct {
        config.enable_shadow_memory = false;
    }

    Ok(config)
}

fn bench(
    config: PageGuardConfig,
    write_watch: Option<WriteWatchType>,
    size: usize,
    writes: usize,
    iterations: usize,
    dump_stats: bool,
) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidArgument("region size must be non-zero"));
    }

    let manager = match write_watch {
        Some(write_watch) => PageGuardManager::with_backends(
            config,
            pageguard::fault::default_fault_source(),
            write_watch.build(),
        ),
        None => PageGuardManager::new(config),
    };

    let page_size = manager.page_size();
    let mut backing = vec![0u8; size];
    let mapped = NonNull::new(backing.as_mut_ptr()).ok_or(Error::Other)?;
    let memory = unsafe { manager.add_memory(0, mapped, size)? };

    info!("Tracking {} with config {:?}", human_bytes(size as f64), config);

    let mut rng = rand::thread_rng();

    for iteration in 0..iterations {
        let offsets = (0..writes).map(|_| rng.gen_range(0..size)).collect_vec();

        let start = Instant::now();
        for &offset in &offsets {
            unsafe { std::ptr::write_volatile(memory.as_ptr().add(offset), iteration as u8 + 1) };
        }
        let write_time = start.elapsed();

        let start = Instant::now();
        let mut nr_ranges = 0;
        let mut dirty_bytes = 0;
        manager.process_memory_entry(0, |range| {
            nr_ranges += 1;
            dirty_bytes += range.len;
        })?;
        let drain_time = start.elapsed();

        let nr_pages_written = offsets.iter().map(|offset| offset / page_size).unique().count();

        println!(
            "iteration {iteration}: {nr_pages_written} pages written in {write_time:?}, \
             drained {nr_ranges} ranges ({}) in {drain_time:?}",
            human_bytes(dirty_bytes as f64)
        );
    }

    manager.remove_memory(0);

    if dump_stats {
        println!("{}", as_text(&manager));
    }

    Ok(())
}

fn main() {
    let cli = CliArgs::parse();

    let mut env_logger_builder = pretty_env_logger::formatted_timed_builder();

    env_logger_builder.parse_default_env();

    if let Some(log_output) = cli.log_output {
        let log_file = Box::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_output)
                .expect("Can't create file"),
        );

        env_logger_builder.target(pretty_env_logger::env_logger::Target::Pipe(log_file));
    }

    env_logger_builder.init();

    let result = match cli.command {
        Command::Features => {
            show_features();
            Ok(())
        }
        Command::Bench {
            config,
            direct,
            write_watch,
            size,
            writes,
            iterations,
            dump_stats,
        } => load_config(config, direct)
            .and_then(|config| bench(config, write_watch, size, writes, iterations, dump_stats)),
    };

    if let Err(e) = result {
        eprintln!("pgtrace: {e}");
        std::process::exit(1);
    }
}
