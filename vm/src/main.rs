use std::process;

use clap::{Parser, Subcommand};

use circuit::samples;
use vm::{StressOptions, StressReport, dump_method, run_stress};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Allocate a linked object graph and run every collection over it
    GcStress {
        #[arg(long, default_value_t = 200_000, help = "Objects to allocate")]
        objects: usize,

        #[arg(long, default_value_t = 10, help = "Keep every K-th object reachable")]
        live_every: usize,

        #[arg(long, help = "Run marking on the pause instead of concurrently")]
        no_concurrent: bool,
    },
    /// Print the control flow graph and circuit of a built-in method
    Cfg {
        #[arg(value_parser = samples::NAMES)]
        sample: String,
    },
}

fn print_report(report: &StressReport) {
    println!(
        "allocated {} objects, {} reachable, {:.2}ms",
        report.allocated, report.live_objects, report.elapsed_ms
    );
    println!(
        "heap objects {} bytes, committed {} bytes",
        report.heap_object_size, report.committed_size
    );
    let stats = &report.stats;
    for (name, pauses) in [("young", &stats.young), ("partial", &stats.partial), ("full", &stats.full)] {
        if pauses.count == 0 {
            continue;
        }
        println!(
            "{name:>8}: {} collections, avg {:?}, min {:?}, max {:?}, total {:?}",
            pauses.count,
            pauses.average(),
            pauses.min,
            pauses.max,
            pauses.total
        );
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::GcStress {
            objects,
            live_every,
            no_concurrent,
        } => {
            let options = StressOptions {
                objects,
                live_every,
                concurrent: !no_concurrent,
                ..StressOptions::default()
            };
            match run_stress(&options) {
                Ok(report) => print_report(&report),
                Err(err) => {
                    eprintln!("gc-stress failed: {err}");
                    process::exit(1);
                }
            }
        }
        Command::Cfg { sample } => {
            let Some(method) = samples::by_name(&sample) else {
                eprintln!("unknown sample `{sample}`");
                process::exit(1);
            };
            match dump_method(&method) {
                Ok(text) => print!("{text}"),
                Err(err) => {
                    eprintln!("translation failed: {err}");
                    process::exit(1);
                }
            }
        }
    }
}
