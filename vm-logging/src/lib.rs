//! Tracing setup for vmbackup.
//!
//! Settings are read from the environment:
//!
//! - `LOG_LEVEL`: default filter (`info`); `RUST_LOG` takes precedence
//! - `LOG_OUTPUT`: `console`, `file` or `both`
//! - `LOG_FORMAT`: `human` or `json`
//! - `LOG_TAGS`: span field filters such as `vm:PRD-web,kind:vdi-export`
//! - `LOG_FILE_PATH`: log file, rolled daily
//!
//! Console output goes to stderr so stdout stays clean for plan and JSON
//! output.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    layer::{Context, Layer},
    prelude::*,
    registry::LookupSpan,
    EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/var/log/vmbackup.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Console,
        }
    }
}

/// A `key:value` filter on span fields. `*` matches any value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub json: bool,
    pub tags: Vec<Tag>,
    pub file_path: PathBuf,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            output: lookup("LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(LogOutput::Console),
            json: lookup("LOG_FORMAT").is_some_and(|v| v.trim() == "json"),
            tags: lookup("LOG_TAGS").map(|v| parse_tags(&v)).unwrap_or_default(),
            file_path: lookup("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
        }
    }
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            (!key.is_empty()).then(|| Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Fields recorded on a span, stored in its extensions.
#[derive(Default)]
struct SpanFields(HashMap<String, String>);

impl Visit for SpanFields {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Keeps only events inside a span whose fields satisfy every tag.
///
/// Each backup target runs in a span carrying `vm` and `kind`, so
/// `LOG_TAGS=vm:PRD-web` narrows output to a single machine.
struct TagFilterLayer {
    tags: Vec<Tag>,
}

impl TagFilterLayer {
    fn accepts(&self, lookup: impl Fn(&str) -> Option<String>) -> bool {
        self.tags.iter().all(|tag| {
            lookup(&tag.key).is_some_and(|value| tag.value == "*" || value.contains(&tag.value))
        })
    }
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let mut fields = SpanFields::default();
            attrs.record(&mut fields);
            span.extensions_mut().insert(fields);
        }
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.tags.is_empty() {
            return true;
        }
        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        // Innermost span wins when a key is recorded at several levels.
        let spans: Vec<_> = scope.collect();
        self.accepts(|key| {
            spans.iter().find_map(|span| {
                span.extensions()
                    .get::<SpanFields>()
                    .and_then(|fields| fields.0.get(key).cloned())
            })
        })
    }
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let dir = path.parent().unwrap_or_else(|| Path::new("/tmp"));
    let file_name = path.file_name().unwrap_or("vmbackup.log".as_ref());
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name))
}

/// Install the global subscriber described by the environment.
///
/// The returned guard must be held for the life of the process when file
/// output is enabled; dropping it flushes the log file.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let tag_filter = TagFilterLayer {
        tags: settings.tags.clone(),
    };

    let (writer, guard) = match settings.output {
        LogOutput::Console => (BoxMakeWriter::new(std::io::stderr), None),
        LogOutput::File => {
            let (file, guard) = file_writer(&settings.file_path);
            (BoxMakeWriter::new(file), Some(guard))
        }
        LogOutput::Both => {
            let (file, guard) = file_writer(&settings.file_path);
            (BoxMakeWriter::new(std::io::stderr.and(file)), Some(guard))
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(settings.output == LogOutput::Console)
        .with_writer(writer);
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(tag_filter);
    if settings.json {
        subscriber.with(fmt_layer.json()).init();
    } else {
        subscriber.with(fmt_layer.compact()).init();
    }

    guard
}
