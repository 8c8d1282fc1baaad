//! Receive path.
//!
//! Every message delivered to a messenger's window ends up in
//! [`Core::dispatch`], whether it arrived directly or through a tunnel.

use crate::client::{Core, Reply};
use crate::envelope::{self, Envelope, MessageType};
use crate::registry::{AckOutcome, ResponseOutcome};
use async_runtime::Deferred;
use core_types::{MessageError, MessageResult};
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use web_platform::{DomainMatcher, MessageEvent, WindowId, OPAQUE_ORIGIN};

/// The origin a message is treated as coming from.
///
/// Mock senders are taken at their word, and `file://` pages, which browsers
/// report as `"null"`, are given back their scheme.
pub(crate) fn effective_origin(origin: &str, source_domain: &str) -> String {
    if source_domain.starts_with("mock:") {
        return source_domain.to_string();
    }
    if origin == OPAQUE_ORIGIN && source_domain.starts_with("file:") {
        return source_domain.to_string();
    }
    origin.to_string()
}

/// Domain to answer a message from `origin` with.
fn reply_domain(origin: &str) -> DomainMatcher {
    if origin == OPAQUE_ORIGIN {
        DomainMatcher::Any
    } else {
        DomainMatcher::from(origin)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("Handler panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("Handler panicked: {}", message)
    } else {
        "Handler panicked".to_string()
    }
}

impl Core {
    /// Entry point of the window's message listener.
    pub(crate) fn receive(self: &Arc<Self>, event: &MessageEvent) {
        if self.is_destroyed() {
            return;
        }
        let Some(message) = envelope::parse(&event.data) else {
            return;
        };
        self.dispatch(event.source, &event.origin, message);
    }

    /// Routes a parsed envelope from `source`.
    pub(crate) fn dispatch(self: &Arc<Self>, source: WindowId, origin: &str, message: Envelope) {
        if !message.fire_and_forget && self.topology.is_window_closed(source) {
            tracing::trace!(
                window = %source,
                name = %message.name,
                "dropping message from closed window"
            );
            return;
        }
        if !self.registry.mark_seen(&message.id) {
            tracing::trace!(id = %message.id, name = %message.name, "dropping duplicate message");
            return;
        }
        let origin = effective_origin(origin, &message.source_domain);
        tracing::debug!(
            kind = ?message.kind,
            name = %message.name,
            window = %source,
            %origin,
            "received"
        );
        match message.kind {
            MessageType::Request => self.handle_request(source, origin, message),
            MessageType::Ack => self.handle_ack(origin, message),
            MessageType::Response => self.handle_response(source, origin, message),
        }
    }

    fn reply(&self, target: WindowId, origin: &str, message: Envelope) {
        if let Err(error) = self.send_envelope(target, &message, &reply_domain(origin)) {
            tracing::warn!(
                kind = ?message.kind,
                name = %message.name,
                window = %target,
                %error,
                "failed to answer request"
            );
        }
    }

    fn handle_request(self: &Arc<Self>, source: WindowId, origin: String, request: Envelope) {
        let fire_and_forget = request.fire_and_forget;
        if !fire_and_forget {
            if request.hash.is_none() {
                tracing::warn!(name = %request.name, %origin, "request without hash");
                return;
            }
            let ack = Envelope::ack_for(&self.stamp, &request, &origin);
            self.reply(source, &origin, ack);
        }

        let listener = self
            .registry
            .find_request_listener(&request.name, source)
            .filter(|listener| {
                !listener.domain.matches(&origin) || self.registry.claim_request_listener(listener)
            });
        let Some(listener) = listener else {
            let error = MessageError::no_handler(format!(
                "No handler found for post message: {} from {} in {}",
                request.name, origin, self.stamp.source_domain
            ));
            tracing::error!(
                name = %request.name,
                %origin,
                window = %source,
                "no handler for request"
            );
            if !fire_and_forget {
                let response = Envelope::response_for(&self.stamp, &request, &origin, Err(error));
                self.reply(source, &origin, response);
            }
            return;
        };

        let pending: Deferred<Value> = if listener.domain.matches(&origin) {
            let event = MessageEvent {
                source,
                origin: origin.clone(),
                data: request.data.clone(),
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (listener.handler)(event)))
                .unwrap_or_else(|payload| Err(MessageError::handler(panic_message(payload))));
            match outcome {
                Ok(Reply::Value(value)) => Deferred::resolved(value),
                Ok(Reply::Pending(pending)) => pending,
                Err(error) => Deferred::rejected(error),
            }
        } else {
            tracing::warn!(
                name = %request.name,
                %origin,
                expected = %listener.domain,
                "request origin does not match listener domain"
            );
            Deferred::rejected(MessageError::domain_mismatch(format!(
                "Request origin {} does not match domain {}",
                origin, listener.domain
            )))
        };

        let core = Arc::clone(self);
        pending.on_settled(move |result: MessageResult<Value>| {
            if let Err(error) = &result {
                tracing::error!(name = %request.name, %origin, %error, "request handler failed");
                if let Some(error_handler) = &listener.error_handler {
                    error_handler(error);
                }
            }
            if fire_and_forget {
                return;
            }
            let response = Envelope::response_for(&core.stamp, &request, &origin, result);
            core.reply(source, &origin, response);
        });
    }

    fn handle_ack(&self, origin: String, ack: Envelope) {
        let Some(hash) = ack.hash.as_deref() else {
            tracing::warn!(name = %ack.name, %origin, "ack without hash");
            return;
        };
        let now = self.browser.event_loop().now();
        match self.registry.record_ack(hash, &origin, now) {
            AckOutcome::Unknown { retired: true } => {
                tracing::trace!(hash, name = %ack.name, "ack for settled request");
            }
            AckOutcome::Unknown { retired: false } => {
                tracing::error!(
                    hash,
                    name = %ack.name,
                    %origin,
                    "no response listener found for ack"
                );
            }
            AckOutcome::DomainMismatch { expected } => {
                tracing::warn!(
                    hash,
                    name = %ack.name,
                    %origin,
                    %expected,
                    "ack origin does not match request domain"
                );
            }
            AckOutcome::Acked { settle } => {
                tracing::debug!(hash, name = %ack.name, "acked");
                if let Some((deferred, result)) = settle {
                    deferred.settle(result);
                }
            }
        }
    }

    fn handle_response(&self, source: WindowId, origin: String, response: Envelope) {
        let Some(hash) = response.hash.clone() else {
            tracing::warn!(name = %response.name, %origin, "response without hash");
            return;
        };
        let name = response.name.clone();
        match self.registry.record_response(&hash, source, &origin, response) {
            ResponseOutcome::Unknown { retired: true } => {
                tracing::trace!(%hash, %name, "response for settled request");
            }
            ResponseOutcome::Unknown { retired: false } => {
                tracing::error!(%hash, %name, %origin, "no response listener found for response");
            }
            ResponseOutcome::WrongSource { expected } => {
                tracing::warn!(
                    %hash,
                    %name,
                    window = %source,
                    %expected,
                    "response from unexpected window"
                );
            }
            ResponseOutcome::Stashed => {
                tracing::debug!(%hash, %name, "response arrived before ack");
            }
            ResponseOutcome::Settle((deferred, result)) => {
                if let Err(error) = &result {
                    tracing::debug!(%hash, %name, %error, "request rejected");
                }
                deferred.settle(result);
            }
        }
    }
}
