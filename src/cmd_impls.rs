use ln_interop::{HarnessConfig, Implementation};

pub(crate) fn cmd_impls(config: &HarnessConfig) {
    for implementation in Implementation::all() {
        let binary = implementation.binary(config);
        let interface = if implementation.has_rpc() { "rpc" } else { "process only" };
        let status = if binary.exists() { "" } else { " (missing)" };
        println!(
            "{:<16} {:<14} {}{}",
            implementation.name(),
            interface,
            binary.display(),
            status
        );
    }
}
