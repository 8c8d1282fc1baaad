//! Send strategies.
//!
//! A send attempts every enabled strategy and succeeds if any of them
//! delivered. Failures are kept in a bounded diagnostics buffer whether or
//! not the send as a whole succeeded.

use crate::client::Core;
use crate::config::{BRIDGE_STRATEGY, POST_MESSAGE_STRATEGY};
use crate::envelope::Envelope;
use core_types::{ErrorKind, MessageError, MessageResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use web_platform::{DomainMatcher, WindowId, WILDCARD};

/// Name reported for deliveries made in mock mode.
pub const MOCK_STRATEGY: &str = "mock";

/// One failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    /// Strategy that failed
    pub strategy: String,
    /// Window the message was addressed to
    pub target: WindowId,
    /// Message name
    pub name: String,
    /// Why the strategy could not deliver
    pub reason: String,
    /// Event loop time of the attempt
    pub at: u64,
}

impl StrategyFailure {
    /// `strategy: reason`, the form used in aggregate errors.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.strategy, self.reason)
    }
}

/// Outcome of a send that reached its target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Strategies that delivered the message
    pub delivered_via: Vec<String>,
    /// Strategies that failed
    pub failures: Vec<StrategyFailure>,
}

/// Bounded record of recent strategy failures.
pub(crate) struct Diagnostics {
    capacity: usize,
    records: Mutex<VecDeque<StrategyFailure>>,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, failure: StrategyFailure) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(failure);
    }

    pub fn snapshot(&self) -> Vec<StrategyFailure> {
        self.records.lock().iter().cloned().collect()
    }
}

/// Everything a strategy needs to deliver one envelope.
pub(crate) struct SendContext<'a> {
    pub core: &'a Core,
    pub target: WindowId,
    pub envelope: &'a Envelope,
    pub domain: &'a DomainMatcher,
}

/// A way of getting an envelope into another window.
pub(crate) trait SendStrategy: Send + Sync {
    /// Name used in configuration and diagnostics.
    fn name(&self) -> &'static str;

    /// Delivers the envelope, or says why it cannot.
    fn send(&self, ctx: &SendContext<'_>) -> MessageResult<()>;
}

/// Posts straight into the target window.
pub(crate) struct DirectSend;

impl SendStrategy for DirectSend {
    fn name(&self) -> &'static str {
        POST_MESSAGE_STRATEGY
    }

    fn send(&self, ctx: &SendContext<'_>) -> MessageResult<()> {
        let core = ctx.core;
        let topology = &core.topology;
        if !core.config.allow_postmessage_popup
            && !topology.is_same_top_window(core.window, ctx.target)
            && !topology.is_same_domain(ctx.target)
        {
            return Err(MessageError::new(
                ErrorKind::SecurityError,
                "Post message through popup disabled",
            ));
        }

        let wire = ctx.envelope.to_wire();
        let proxy = topology.proxy(ctx.target);
        for target_origin in ctx.domain.post_targets() {
            proxy.post_message(wire.clone(), &target_origin)?;
        }
        Ok(())
    }
}

/// Relays through the tunnel negotiated with the target's bridge.
pub(crate) struct BridgeSend;

impl SendStrategy for BridgeSend {
    fn name(&self) -> &'static str {
        BRIDGE_STRATEGY
    }

    fn send(&self, ctx: &SendContext<'_>) -> MessageResult<()> {
        let core = ctx.core;
        let topology = &core.topology;
        if topology.is_same_domain(ctx.target) {
            return Err(MessageError::invalid_target(
                "Post message through bridge disabled between same domain windows",
            ));
        }
        if topology.is_same_top_window(core.window, ctx.target) {
            return Err(MessageError::invalid_target(
                "Post message through bridge disabled between same top windows",
            ));
        }
        let remote = core.bridges.remote_window(ctx.target).ok_or_else(|| {
            MessageError::bridge(format!("No bridge tunnel open to {}", ctx.target))
        })?;
        if !ctx.domain.matches(&remote.domain) {
            return Err(MessageError::domain_mismatch(format!(
                "Bridged window is on {}, expected {}",
                remote.domain, ctx.domain
            )));
        }
        (remote.send)(ctx.envelope.to_wire())
    }
}

static STRATEGIES: [&dyn SendStrategy; 2] = [&DirectSend, &BridgeSend];

/// Delivers `envelope` to `target` through every enabled strategy.
///
/// Fails with `AllStrategiesFailed` when no strategy delivered; the error
/// details list each strategy's reason.
pub(crate) fn send_message(
    core: &Core,
    target: WindowId,
    envelope: &Envelope,
    domain: &DomainMatcher,
) -> MessageResult<SendReport> {
    if core.config.mock_mode {
        core.topology
            .proxy(target)
            .post_message(envelope.to_wire(), WILDCARD)?;
        return Ok(SendReport {
            delivered_via: vec![MOCK_STRATEGY.to_string()],
            failures: Vec::new(),
        });
    }

    let ctx = SendContext {
        core,
        target,
        envelope,
        domain,
    };
    let mut report = SendReport::default();
    for strategy in STRATEGIES {
        if !core.config.allowed_send_strategies.allows(strategy.name()) {
            continue;
        }
        match strategy.send(&ctx) {
            Ok(()) => {
                tracing::debug!(
                    strategy = strategy.name(),
                    name = %envelope.name,
                    window = %target,
                    kind = ?envelope.kind,
                    "delivered"
                );
                report.delivered_via.push(strategy.name().to_string());
            }
            Err(error) => {
                tracing::debug!(
                    strategy = strategy.name(),
                    name = %envelope.name,
                    window = %target,
                    %error,
                    "strategy failed"
                );
                let failure = StrategyFailure {
                    strategy: strategy.name().to_string(),
                    target,
                    name: envelope.name.clone(),
                    reason: error.message,
                    at: core.browser.event_loop().now(),
                };
                core.diagnostics.record(failure.clone());
                report.failures.push(failure);
            }
        }
    }

    if report.delivered_via.is_empty() {
        let details: Vec<String> = report.failures.iter().map(StrategyFailure::describe).collect();
        let summary = if details.is_empty() {
            "no send strategy is enabled".to_string()
        } else {
            details.join("\n\n")
        };
        return Err(MessageError::new(
            ErrorKind::AllStrategiesFailed,
            format!("All post message strategies failed:\n\n{}", summary),
        )
        .with_details(details));
    }
    Ok(report)
}
