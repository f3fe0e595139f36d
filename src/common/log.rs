//! Logging helpers

/// Initialize the global logger
///
/// `RUST_LOG` takes precedence over `level` when it is set. Calling this
/// more than once is harmless; later calls are ignored.
///
/// # Parameters
///
/// * `level` - Default log filter, e.g. `info` or `relay_proxy=debug`
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
