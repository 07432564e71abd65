//! Logging setup.
//!
//! The core logs through the `log` facade: collections at `info`, phase transitions and
//! registry changes at `debug`, per-slot scanning at `trace`, and skipped stale-reference
//! eliminations at `warn`. With the default "builtin_env_logger" feature, building an
//! instance installs an `env_logger` whose base level comes from
//! [`Options::log_level`](crate::util::options::Options); the standard `RUST_LOG` variable
//! still takes precedence, so an embedder can shape the output per module. A VM with its
//! own logging framework can disable the feature and register a `log` implementation
//! itself, in which case building an instance touches nothing.

use crate::util::options::Options;

/// Install the built-in logger, honouring the configured base level. Keeps whatever
/// logger is already registered, if any.
#[cfg(feature = "builtin_env_logger")]
pub(crate) fn try_init(options: &Options) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(options.log_level);
    // RUST_LOG refines or overrides the configured base level.
    builder.parse_default_env();
    if builder.try_init().is_err() {
        debug!("a logger is already installed, leaving it in place");
    }
}

#[cfg(not(feature = "builtin_env_logger"))]
pub(crate) fn try_init(_options: &Options) {}
