use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{BuildReport, ConcretizeReport, ProgressEvent, ProgressSink, ValidateReport};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_build(report: &BuildReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_concretize(report: &ConcretizeReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_validate(report: &ValidateReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_text(text: &str) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            stdout.write_all(b"\n")?;
        }
        Ok(())
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Forwards progress events to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
