//! Custom tracing layers for nwkmesh
//!
//! [`NodeContextLayer`] attaches the active [`NodeContextGuard`] to every
//! new span so later layers can tell which node a span belongs to.
//! [`node_span`] turns the same context into span fields that the JSON
//! formatter writes out.

use tracing::{Span, Subscriber, info_span, span};
use tracing_subscriber::{
    fmt::{
        self, MakeWriter,
        format::{Format, Json, JsonFields},
    },
    layer::{Context, Layer},
    registry::LookupSpan,
};

use crate::context::{NodeContextData, NodeContextGuard};

/// Layer that injects node context into spans
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeContextLayer;

impl NodeContextLayer {
    pub fn new() -> Self {
        Self
    }
}

/// Extension data stored on spans
#[derive(Debug, Clone)]
pub struct NodeContextExtension {
    pub data: NodeContextData,
}

impl<S> Layer<S> for NodeContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        if let Some(node) = NodeContextGuard::current() {
            span.extensions_mut().insert(NodeContextExtension { data: node });
        }
    }
}

/// Span carrying a node's identity as recorded fields
pub fn node_span(node: &NodeContextData) -> Span {
    info_span!(
        "node",
        short_addr = %node.short_addr,
        ieee = %node.ieee_addr,
        device_type = %node.device_type,
        instance_id = %node.instance_id,
    )
}

/// JSONL formatting layer with the settings used for log aggregation
pub fn jsonl_layer<S, W>(
    writer: W,
    flatten_events: bool,
    include_spans: bool,
    include_location: bool,
    include_thread_info: bool,
) -> fmt::Layer<S, JsonFields, Format<Json>, W>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(include_spans)
        .flatten_event(flatten_events)
        .with_file(include_location)
        .with_line_number(include_location)
        .with_thread_ids(include_thread_info)
        .with_thread_names(include_thread_info)
        .with_writer(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nwkmesh_core::{DeviceType, ExtAddr, ShortAddr};
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::Event;
    use tracing_subscriber::{Registry, layer::SubscriberExt};

    /// Records the node context of each event's parent span
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Option<ShortAddr>>>>,
    }

    impl<S> Layer<S> for Recorder
    where
        S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    {
        fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
            let node = ctx.event_span(event).and_then(|span| {
                span.extensions()
                    .get::<NodeContextExtension>()
                    .map(|ext| ext.data.short_addr)
            });
            self.seen.lock().unwrap().push(node);
        }
    }

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_spans_pick_up_active_context() {
        let recorder = Recorder::default();
        let subscriber = Registry::default()
            .with(NodeContextLayer::new())
            .with(recorder.clone());

        tracing::subscriber::with_default(subscriber, || {
            let outside = info_span!("outside");
            outside.in_scope(|| tracing::info!("no node"));

            let _guard = NodeContextGuard::new(
                ShortAddr(0x0A0B),
                ExtAddr(0x00124B0000000001),
                DeviceType::Router,
            );
            let inside = info_span!("inside");
            inside.in_scope(|| tracing::info!("on a node"));
        });

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(*seen, vec![None, Some(ShortAddr(0x0A0B))]);
    }

    #[test]
    fn test_node_span_fields_reach_jsonl() {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = Registry::default().with(jsonl_layer(
            move || writer.clone(),
            true,
            true,
            false,
            false,
        ));

        let _guard = NodeContextGuard::new(
            ShortAddr(0x1234),
            ExtAddr(0x00124B00000000FF),
            DeviceType::EndDevice,
        );
        let node = NodeContextGuard::current().unwrap();
        tracing::subscriber::with_default(subscriber, || {
            node_span(&node).in_scope(|| tracing::info!(seq = 7, "frame sent"));
        });

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["message"], "frame sent");
        assert_eq!(line["seq"], 7);
        assert_eq!(line["span"]["short_addr"], "0x1234");
        assert_eq!(line["span"]["device_type"], "end-device");
    }
}
