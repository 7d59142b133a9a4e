fn main() {
    if let Err(err) = gateway_sidecar::cli::run_sidecar() {
        tracing::error!(error = %err, "gateway-sidecar failed");
        std::process::exit(1);
    }
}
