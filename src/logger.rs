use std::fs::File;
use std::path::Path;

use anyhow::Context;
use time::{format_description, OffsetDateTime, UtcOffset};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Installs a global subscriber writing timestamped plain-text logs to a
/// fresh file under `dir`. Fails when the file cannot be created or a
/// subscriber is already installed; the core runs fine without one.
pub fn init_logger(dir: &Path) -> anyhow::Result<()> {
    let path = dir.join(log_file_name()?);
    let file = File::create(&path)
        .with_context(|| format!("could not create log file {}", path.display()))?;

    // Local offset is unavailable once threads are running; UTC then.
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .context("timestamp format")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(BoxMakeWriter::new(file))
        .finish();

    set_global_default(subscriber).context("a tracing subscriber is already set")
}

fn log_file_name() -> anyhow::Result<String> {
    let format = format_description::parse("arena_[year][month][day]_[hour][minute][second].log")
        .context("file name format")?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(now.format(&format)?)
}
