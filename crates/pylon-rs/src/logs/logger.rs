use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;

// Visible width of the '[LEVEL]' column including padding.
const LEVEL_FIELD_WIDTH: usize = 8;

/// Initializes the process-wide logger.
///
/// Output format: `Jan 02 06 03:04:05 PM | [LEVEL] | target | message`,
/// with the level colored unless `NO_COLOR` is set. The filter honors
/// `RUST_LOG` and defaults to `info`.
pub fn configure_logger() {
    let no_color = env::var("NO_COLOR").is_ok();

    let mut builder = Builder::new();
    builder.format(move |buf, record| {
        let level_plain = record.level().to_string();
        let colored_level = if no_color {
            level_plain.clone()
        } else {
            let code = match record.level() {
                log::Level::Error => "31",
                log::Level::Warn => "33",
                log::Level::Info => "32",
                log::Level::Debug => "34",
                log::Level::Trace => "35",
            };
            format!("\x1b[{}m{}\x1b[0m", code, level_plain)
        };

        // Pad on the plain width so color codes don't break the columns.
        let padding = LEVEL_FIELD_WIDTH.saturating_sub(level_plain.len() + 2).max(1);

        writeln!(
            buf,
            "{} | [{}]{}| {} | {}",
            Local::now().format("%b %d %y %I:%M:%S %p"),
            colored_level,
            " ".repeat(padding),
            record.target(),
            record.args(),
        )
    });

    if let Ok(spec) = env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    } else {
        builder.filter_level(LevelFilter::Info);
    }

    // Repeat initialization (e.g. in tests) is not an error worth dying for.
    let _ = builder.try_init();
}
