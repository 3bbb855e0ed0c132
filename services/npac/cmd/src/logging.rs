//! Console log format shared with the other reDB services.
//!
//! Lines look like `[timestamp] [service] [level] message`, where the service
//! column names the component (`npac-transport`, `npac-driver`) when the event
//! carries a `component` field.

use std::fmt;
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const RESET: &str = "\x1b[0m";
const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const BRIGHT_YELLOW: &str = "\x1b[93m";
const BRIGHT_RED: &str = "\x1b[91m";
const BRIGHT_GRAY: &str = "\x1b[90m";

const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Log an info event attributed to a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log a warning attributed to a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log a debug event attributed to a component
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Log an error attributed to a component
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Event formatter for the NPAC gateway service
pub struct NpacLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl NpacLogFormatter {
    /// Formatter for `service_name`, coloured when stdout is a terminal
    pub fn new(service_name: impl Into<String>) -> Self {
        let dumb = std::env::var("TERM").map(|term| term == "dumb").unwrap_or(true);
        Self {
            service_name: service_name.into(),
            color_enabled: !dumb && std::io::stdout().is_terminal(),
        }
    }

    fn service_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };
        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn level_column(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        // icons are two columns wide
        format!("{:<width$}", label, width = LOG_LEVEL_WIDTH + 2)
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }

    fn level_color(&self, level: &Level) -> &'static str {
        self.paint(match *level {
            Level::ERROR => BRIGHT_RED,
            Level::WARN => BRIGHT_YELLOW,
            Level::INFO => GREEN,
            Level::DEBUG | Level::TRACE => BRIGHT_GRAY,
        })
    }
}

impl<S, N> FormatEvent<S, N> for NpacLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            self.paint(CYAN),
            timestamp,
            self.service_column(fields.component.as_deref()),
            self.level_color(level),
            Self::level_column(level),
            self.paint(RESET)
        )?;
        writeln!(writer, "{}{}", fields.message, self.paint(RESET))
    }
}

/// Message and component of one event
#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        match field.name() {
            "message" => self.message = unquoted,
            "component" => self.component = Some(unquoted),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}
