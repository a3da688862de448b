//! Ambient logging setup (§10 demonstrator support).
//!
//! No teacher file sets this up directly (`rustysd`'s own binary entrypoint
//! was out of scope for this crate), so this is grounded on
//! `libsystemd::logging::setup_logging` from the wider pack: `fern::Dispatch`
//! with a `chrono`-timestamped, level-colored line format, chained to
//! stdout.

use log::LevelFilter;

/// Installs a process-global logger. Safe to call once per process; a
/// second call returns the `fern`/`log` "already initialized" error, which
/// callers can ignore in tests that run more than one case per binary.
pub fn setup_logging(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            let level = record.level();
            let colored_level = match level {
                log::Level::Error => format!("\x1b[31m{level}\x1b[0m"),
                log::Level::Warn => format!("\x1b[33m{level}\x1b[0m"),
                log::Level::Info => format!("\x1b[32m{level}\x1b[0m"),
                log::Level::Debug => format!("\x1b[34m{level}\x1b[0m"),
                log::Level::Trace => format!("\x1b[36m{level}\x1b[0m"),
            };
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                colored_level,
                message
            ));
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
}
