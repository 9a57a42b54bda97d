use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};

/// Log level comes from $RUST_LOG; without it the config's debug flag
/// selects between debug and info.
pub fn init_logger(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();
}
