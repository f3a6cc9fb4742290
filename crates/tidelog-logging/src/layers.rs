//! Custom tracing layers for tidelog
//!
//! This module provides layers that attach scavenge run context to spans and
//! a JSONL formatting layer for console and file output.

use tracing::{Subscriber, span};
use tracing_subscriber::{
    layer::{Context, Layer},
    registry::LookupSpan,
};

use crate::config::JsonlConfig;
use crate::context::{ScavengeContextData, ScavengeContextGuard};

/// Layer that attaches scavenge context to spans
///
/// Spans created while a [`ScavengeContextGuard`] is active carry a
/// [`ScavengeContextExtension`], so the context survives even when the span is
/// later entered on a thread without a guard.
pub struct ScavengeContextLayer;

impl ScavengeContextLayer {
    /// Create a new scavenge context layer
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScavengeContextLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension data stored on spans
#[derive(Debug, Clone)]
pub struct ScavengeContextExtension {
    pub data: ScavengeContextData,
}

impl<S> Layer<S> for ScavengeContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let data = ScavengeContextGuard::current().or_else(|| {
            span.parent()
                .and_then(|parent| parent.extensions().get::<ScavengeContextExtension>().cloned())
                .map(|ext| ext.data)
        });

        if let Some(data) = data {
            span.extensions_mut().insert(ScavengeContextExtension { data });
        }
    }
}

/// Create a JSONL formatting layer
///
/// Event fields sit at the top level of each record. The innermost span,
/// usually a [`phase_span`](crate::context::phase_span), is under `span`.
pub fn jsonl_layer<S, W>(
    writer: W,
    config: &JsonlConfig,
) -> tracing_subscriber::fmt::Layer<
    S,
    tracing_subscriber::fmt::format::JsonFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Json>,
    W,
>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(config.span_list)
        .flatten_event(true)
        .with_file(config.location)
        .with_line_number(config.location)
        .with_thread_names(config.thread_names)
        .with_writer(writer)
}
