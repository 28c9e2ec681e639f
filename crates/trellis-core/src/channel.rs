//! Channels: a filter stack over one transport, plus the shared metadata
//! machinery every call on the channel uses.

use std::sync::Arc;
use std::time::Instant;

use crate::call::{Call, CallInit, Propagation};
use crate::completion::CompletionQueue;
use crate::config::{ChannelArgs, ChannelConfig};
use crate::error::StatusCode;
use crate::filter::{ChannelOp, ChannelStack, Filter};
use crate::filter::connected::ConnectedFilter;
use crate::metadata::{MdElem, MdStr, MetadataContext};
use crate::transport::{ServerTransportData, Transport, TransportEvent};

/// Interned handles for the headers the engine itself produces or consumes.
pub(crate) struct WellKnownKeys {
    pub status: MdStr,
    pub message: MdStr,
    pub encoding: MdStr,
    pub accept_encoding: MdStr,
    pub path: MdStr,
    pub authority: MdStr,
}

/// A method registered up front so its routing headers are interned once.
#[derive(Clone)]
pub struct RegisteredMethod {
    pub(crate) path: MdElem,
    pub(crate) authority: Option<MdElem>,
}

/// A channel: shared metadata context, resolved configuration, and the
/// filter stack terminated by the transport-binding filter.
pub struct Channel {
    mdctx: Arc<MetadataContext>,
    config: ChannelConfig,
    stack: Arc<ChannelStack>,
    keys: WellKnownKeys,
    /// Status elements for the codes every call ends up sending sooner or
    /// later, pre-built with their decode cache primed.
    status_cache: [MdElem; 3],
    default_authority: Option<MdElem>,
}

impl Channel {
    /// Build a channel over `transport`. `filters` are installed top-down;
    /// the transport-binding terminal filter is appended here.
    pub fn new(
        transport: Arc<dyn Transport>,
        mut filters: Vec<Arc<dyn Filter>>,
        args: &ChannelArgs,
    ) -> Arc<Self> {
        let config = ChannelConfig::from_args(args);
        filters.push(ConnectedFilter::new(transport) as Arc<dyn Filter>);
        let stack = ChannelStack::new(filters, args);
        let mdctx = MetadataContext::new();
        let keys = WellKnownKeys {
            status: mdctx.intern_str("trellis-status"),
            message: mdctx.intern_str("trellis-message"),
            encoding: mdctx.intern_str("trellis-encoding"),
            accept_encoding: mdctx.intern_str("trellis-accept-encoding"),
            path: mdctx.intern_str(":path"),
            authority: mdctx.intern_str(":authority"),
        };
        let status_elem = |code: StatusCode| {
            let elem = mdctx.elem_from_strings(
                keys.status.clone(),
                mdctx.intern_str(&(code as u32).to_string()),
            );
            // Prime the decode cache so the hot path never parses these.
            elem.decoded_status();
            elem
        };
        let status_cache = [
            status_elem(StatusCode::Ok),
            status_elem(StatusCode::Cancelled),
            status_elem(StatusCode::Internal),
        ];
        let default_authority = config
            .default_authority
            .as_deref()
            .map(|a| mdctx.elem_from_strings(keys.authority.clone(), mdctx.intern_str(a)));
        Arc::new(Self {
            mdctx,
            config,
            stack,
            keys,
            status_cache,
            default_authority,
        })
    }

    pub fn metadata_context(&self) -> &Arc<MetadataContext> {
        &self.mdctx
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub(crate) fn stack(&self) -> &ChannelStack {
        &self.stack
    }

    pub(crate) fn keys(&self) -> &WellKnownKeys {
        &self.keys
    }

    /// The `trellis-status` element for `code`, cached for the common codes.
    pub(crate) fn status_elem(&self, code: StatusCode) -> MdElem {
        for cached in &self.status_cache {
            if cached.decoded_status() == code {
                return cached.clone();
            }
        }
        let elem = self.mdctx.elem_from_strings(
            self.keys.status.clone(),
            self.mdctx.intern_str(&(code as u32).to_string()),
        );
        elem.decoded_status();
        elem
    }

    /// Register handler for connection-level transport events (stream
    /// accepted, goaway, connection closed). Capture a `Weak<Channel>` in
    /// the handler; the stack keeps it alive for the channel's lifetime.
    pub fn set_event_handler(&self, handler: impl Fn(TransportEvent) + Send + Sync + 'static) {
        self.stack.set_event_sink(handler);
    }

    /// Ask the transport to wind the connection down.
    pub fn disconnect(&self) {
        self.stack.channel_op(ChannelOp::Disconnect);
    }

    /// Pre-intern the routing headers for a method that will be called
    /// repeatedly.
    pub fn register_method(&self, method: &str, authority: Option<&str>) -> RegisteredMethod {
        let path = self
            .mdctx
            .elem_from_strings(self.keys.path.clone(), self.mdctx.intern_str(method));
        let authority = authority
            .map(|a| {
                self.mdctx
                    .elem_from_strings(self.keys.authority.clone(), self.mdctx.intern_str(a))
            })
            .or_else(|| self.default_authority.clone());
        RegisteredMethod { path, authority }
    }

    /// Create a client call on this channel.
    pub fn create_call(
        self: &Arc<Self>,
        cq: Arc<CompletionQueue>,
        method: &str,
        authority: Option<&str>,
        deadline: Option<Instant>,
    ) -> Arc<Call> {
        let registered = self.register_method(method, authority);
        self.create_registered_call(cq, &registered, deadline)
    }

    /// Create a client call from pre-registered routing headers.
    pub fn create_registered_call(
        self: &Arc<Self>,
        cq: Arc<CompletionQueue>,
        method: &RegisteredMethod,
        deadline: Option<Instant>,
    ) -> Arc<Call> {
        Call::create(
            self.clone(),
            CallInit {
                is_client: true,
                cq,
                path: Some(method.path.clone()),
                authority: method.authority.clone(),
                deadline,
                parent: None,
                propagation: Propagation::default(),
                server_data: None,
            },
        )
    }

    /// Create a client call that inherits deadline and cancellation from a
    /// server call it is working on behalf of.
    pub fn create_child_call(
        self: &Arc<Self>,
        cq: Arc<CompletionQueue>,
        method: &str,
        authority: Option<&str>,
        deadline: Option<Instant>,
        parent: &Arc<Call>,
        propagation: Propagation,
    ) -> Arc<Call> {
        let registered = self.register_method(method, authority);
        Call::create(
            self.clone(),
            CallInit {
                is_client: true,
                cq,
                path: Some(registered.path),
                authority: registered.authority,
                deadline,
                parent: Some(parent.clone()),
                propagation,
                server_data: None,
            },
        )
    }

    /// Create the server-side call for an accepted inbound stream.
    pub fn create_server_call(
        self: &Arc<Self>,
        cq: Arc<CompletionQueue>,
        server_data: ServerTransportData,
    ) -> Arc<Call> {
        Call::create(
            self.clone(),
            CallInit {
                is_client: false,
                cq,
                path: None,
                authority: None,
                deadline: None,
                parent: None,
                propagation: Propagation::default(),
                server_data: Some(server_data),
            },
        )
    }
}
