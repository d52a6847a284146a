//! Logger configuration and structured output formatting.
//!
//! Column-aligned text output for development, plain output for
//! structured log collectors (`NO_COLOR`). Every token is padded to its
//! column while it is still plain text and only styled afterwards, so
//! alignment never has to reason about escape sequences. Styling comes
//! from `console`; sink rotation is the deployment's job, the gateway
//! only formats and filters.

use chrono::Local;
use console::Style;
use env_logger::Builder;
use log::{Level, LevelFilter};
use std::env;
use std::io::Write;

/// Width of the level column; one past the longest level name so every
/// level pads the same way.
const LEVEL_WIDTH: usize = 6;
/// Width of the `file:line` source-location column.
const LOCATION_WIDTH: usize = 24;

fn parse_level(level: &str) -> LevelFilter {
    match level {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Style for the level column. Forced on because env_logger hands us a
/// buffer, not a terminal `console` could probe.
fn level_style(level: Level) -> Style {
    let style = Style::new().force_styling(true);
    match level {
        Level::Error => style.red().bold(),
        Level::Warn => style.yellow().bold(),
        Level::Info => style.green(),
        Level::Debug => style.blue(),
        Level::Trace => style.magenta().dim(),
    }
}

/// Left-aligns a plain token into its column. Tokens wider than the
/// column get a single trailing space so neighbors never touch.
fn pad(token: String, width: usize) -> String {
    if token.len() >= width {
        format!("{token} ")
    } else {
        format!("{token:<width$}")
    }
}

/// Configures the process-wide logger.
///
/// `level` comes from the configuration (`logging.level`); the
/// `RUST_LOG` environment variable, when set, wins for debugging
/// convenience. Call once during startup.
pub fn configure_logger(level: &str) {
    let use_color = env::var("NO_COLOR").is_err();
    let filter = match env::var("RUST_LOG") {
        Ok(value) => parse_level(&value),
        Err(_) => parse_level(level),
    };

    Builder::new()
        .format(move |buf, record| {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let level_token = pad(record.level().to_string(), LEVEL_WIDTH);
            let location = pad(
                format!(
                    "{}:{}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0)
                ),
                LOCATION_WIDTH,
            );

            if use_color {
                let frame = Style::new().force_styling(true).dim();
                writeln!(
                    buf,
                    "{} {} {} {}",
                    frame.apply_to(timestamp),
                    level_style(record.level()).apply_to(level_token),
                    frame.apply_to(location),
                    record.args(),
                )
            } else {
                writeln!(
                    buf,
                    "{timestamp} {level_token} {location} {}",
                    record.args()
                )
            }
        })
        .filter_level(filter)
        .try_init()
        .ok();
}
