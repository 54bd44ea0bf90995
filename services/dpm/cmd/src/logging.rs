use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SOURCE_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 9;

/// Crates whose events pass the `--log-level` directive
const DPM_CRATES: &[&str] = &[
    "dpm_manager",
    "dpm_control",
    "dpm_session",
    "dpm_secure",
    "dpm_power",
    "dpm_retention",
];

macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Line format: `[timestamp] [source] [level] message key=value...`
///
/// The source column is `dpm-<component>` for events logged through the
/// `component_*` macros and the service name otherwise.
pub struct DpmLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl DpmLogFormatter {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            color_enabled: std::io::stdout().is_terminal() && std::env::var("TERM").map_or(true, |t| t != "dumb"),
        }
    }

    fn source(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("dpm-{}", component),
            None => self.service_name.clone(),
        };
        if name.chars().count() > SOURCE_WIDTH {
            let cut: String = name.chars().take(SOURCE_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = SOURCE_WIDTH)
        }
    }

    fn level(level: &tracing::Level) -> String {
        let label = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn color(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for DpmLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };
        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            self.source(visitor.component.as_deref()),
            self.color(level),
            Self::level(level),
            reset,
            visitor.message
        )?;
        for (name, value) in &visitor.extra {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl FieldVisitor {
    fn put(&mut self, field: &tracing::field::Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            name => self.extra.push((name, value)),
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        let text = match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            Some(inner) => inner.to_string(),
            None => text,
        };
        self.put(field, text);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.put(field, value.to_string());
    }
}

/// Filter passing `level` for the DPM crates and `info` for everything else
pub fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::new("info");
    for krate in DPM_CRATES {
        filter = filter.add_directive(format!("{}={}", krate, level).parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber
pub fn init(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level)?)
        .event_format(DpmLogFormatter::new("dpm-manager"))
        .init();
    Ok(())
}
