//! Thin demo harness for `doscore`.
//!
//! Not the product: the library has no opinion on how it's driven from a
//! CLI. This binary wires a `CoreState` together and steps it a few times
//! for manual smoke testing: clap-derived `Args`, a small `run()` function,
//! nothing more.

use clap::Parser;
use doscore::config::BackendKind;
use doscore::{CoreConfig, CoreState};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "doscore-harness")]
#[command(about = "Run a few dispatcher loopstep iterations against a chosen backend")]
struct Args {
    /// Execution backend to drive: v86, kvm, interpreter, jit.
    #[arg(long, default_value = "interpreter")]
    backend: String,

    /// Number of loopstep iterations to run before exiting.
    #[arg(long, default_value_t = 10)]
    iterations: u32,
}

fn parse_backend(name: &str) -> Option<BackendKind> {
    match name {
        "v86" => Some(BackendKind::V86),
        "kvm" => Some(BackendKind::Kvm),
        "interpreter" => Some(BackendKind::Interpreter),
        "jit" => Some(BackendKind::Jit),
        _ => None,
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let backend = parse_backend(&args.backend)
        .ok_or_else(|| format!("unknown backend {:?}", args.backend))?;

    let config = CoreConfig {
        backend,
        ..Default::default()
    };
    let mut state = CoreState::new(config)?;

    for i in 0..args.iterations {
        if let Err(e) = state.loopstep() {
            tracing::warn!(iteration = i, error = %e, "loopstep returned a fatal error");
            return Err(Box::new(e));
        }
    }
    tracing::info!(iterations = args.iterations, "harness run complete");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run() {
        eprintln!("doscore-harness: {e}");
        std::process::exit(1);
    }
}
