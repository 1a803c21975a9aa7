use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Safe to call more than once; later calls are
/// no-ops, which lets every test initialise logging.
pub fn init(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(debug))),
        )
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Filter used when `RUST_LOG` is unset. Debug mode also shows every
/// captured daemon line (target `daemon`).
fn default_filter(debug: bool) -> &'static str {
    if debug {
        "ln_interop=debug,daemon=trace,warn"
    } else {
        "ln_interop=info,warn"
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn debug_filter_shows_daemon_output() {
        let filter = super::default_filter(true);
        assert!(filter.split(',').any(|directive| directive == "daemon=trace"));
        assert!(!super::default_filter(false).contains("daemon"));
    }

    #[test]
    fn init_is_idempotent() {
        super::init(false);
        super::init(true);
        tracing::info!("still logging");
    }
}
