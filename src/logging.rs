//! Tracing setup for the `tftp` binary.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber on stderr.
///
/// `verbosity` 0 logs transfers at info, 1 adds per-block debug output, 2 and
/// above enables trace. `RUST_LOG` overrides all of it.
pub fn init_logging(verbosity: u8) -> anyhow::Result<()> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("udp_tftp={level},tftp={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 1),
        )
        .try_init()?;
    Ok(())
}
