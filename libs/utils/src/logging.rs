use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Whether to add the `target` field to formatted output.
#[derive(Clone, Copy)]
pub enum Output {
    Stdout,
    Stderr,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. Calling this twice is an
/// error in the caller; binaries call it exactly once at startup.
pub fn init(output: Output) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || -> Box<dyn std::io::Write> {
            match output {
                Output::Stdout => Box::new(std::io::stdout()),
                Output::Stderr => Box::new(std::io::stderr()),
            }
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
