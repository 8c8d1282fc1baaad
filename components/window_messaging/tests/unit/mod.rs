use async_runtime::Deferred;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use web_platform::{Browser, DomainMatcher, WindowId, WindowType};
use window_messaging::envelope::Stamp;
use window_messaging::{
    bridge, Envelope, ErrorKind, ListenerOptions, MessageError, MessageResult, Messenger,
    MessagingConfig, RequestOptions, SendOptions,
};

fn wait<T: Clone + Send + 'static>(
    browser: &Arc<Browser>,
    deferred: &Deferred<T>,
) -> MessageResult<T> {
    browser.event_loop().run_until(60_000, || !deferred.is_pending());
    deferred.result().expect("Deferred should settle")
}

struct FramePair {
    browser: Arc<Browser>,
    top: WindowId,
    frame: WindowId,
    parent: Messenger,
    child: Messenger,
}

fn frame_pair_at(top_url: &str, config: MessagingConfig) -> FramePair {
    let browser = Browser::new();
    let top = browser.open_window(top_url);
    let parent = Messenger::install(&browser, top, config.clone()).expect("Should install parent");
    let frame = browser
        .open_frame(top, "https://pay.com/button", "button")
        .expect("Should open frame");
    let child = Messenger::install(&browser, frame, config).expect("Should install child");
    browser.event_loop().run_until_idle();
    FramePair {
        browser,
        top,
        frame,
        parent,
        child,
    }
}

fn frame_pair(config: MessagingConfig) -> FramePair {
    frame_pair_at("https://merchant.com/checkout", config)
}

#[cfg(test)]
mod request_tests {
    use super::*;

    #[test]
    fn test_request_resolves_with_handler_value() {
        let pair = frame_pair(MessagingConfig::default());
        pair.child
            .on("ping", ListenerOptions::default(), |event| json!({ "echo": event.data }))
            .unwrap();

        let reply = pair
            .parent
            .request(RequestOptions::new(pair.frame, "ping").with_data(json!("hi")));
        let event = wait(&pair.browser, &reply).unwrap();
        assert_eq!(event.data, json!({ "echo": "hi" }));
        assert_eq!(event.source, pair.frame);
        assert_eq!(event.origin, "https://pay.com");
        assert_eq!(pair.parent.pending_requests(), 0);
    }

    #[test]
    fn test_handler_receives_sender_origin() {
        let pair = frame_pair(MessagingConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pair.child
            .on("who", ListenerOptions::default(), move |event| {
                sink.lock().unwrap().push((event.source, event.origin));
            })
            .unwrap();

        let reply = pair.parent.send(pair.frame, "who", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &reply).unwrap().data, Value::Null);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(pair.top, "https://merchant.com".to_string())]
        );
    }

    #[test]
    fn test_handler_error_rejects_caller() {
        let pair = frame_pair(MessagingConfig::default());
        pair.child
            .on("fail", ListenerOptions::default(), |_| -> MessageResult<Value> {
                Err(MessageError::handler("card declined"))
            })
            .unwrap();

        let reply = pair.parent.send(pair.frame, "fail", Value::Null, SendOptions::default());
        let error = wait(&pair.browser, &reply).unwrap_err();
        assert_eq!(error.kind, ErrorKind::HandlerError);
        assert_eq!(error.message, "card declined");
    }

    #[test]
    fn test_handler_panic_becomes_error_response() {
        let pair = frame_pair(MessagingConfig::default());
        pair.child
            .on("boom", ListenerOptions::default(), |_| -> Value { panic!("exploded") })
            .unwrap();

        let reply = pair.parent.send(pair.frame, "boom", Value::Null, SendOptions::default());
        let error = wait(&pair.browser, &reply).unwrap_err();
        assert_eq!(error.kind, ErrorKind::HandlerError);
        assert!(error.message.contains("exploded"));
    }

    #[test]
    fn test_deferred_reply_arrives_later() {
        let pair = frame_pair(MessagingConfig::default());
        let event_loop = pair.browser.event_loop().clone();
        pair.child
            .on("slow", ListenerOptions::default(), move |_| {
                event_loop.delay(300).then(|()| Ok(json!("late")))
            })
            .unwrap();

        let start = pair.browser.event_loop().now();
        let reply = pair.parent.send(pair.frame, "slow", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &reply).unwrap().data, json!("late"));
        assert!(pair.browser.event_loop().now() - start >= 300);
    }

    #[test]
    fn test_missing_handler_rejects_with_no_handler() {
        let pair = frame_pair(MessagingConfig::default());
        let reply = pair.parent.send(pair.frame, "nobody", Value::Null, SendOptions::default());
        let error = wait(&pair.browser, &reply).unwrap_err();
        assert_eq!(error.kind, ErrorKind::NoHandler);
        assert!(error.message.contains("nobody"));
    }

    #[test]
    fn test_missing_parameters() {
        let pair = frame_pair(MessagingConfig::default());
        let no_name = pair.parent.request(RequestOptions::new(pair.frame, ""));
        assert_eq!(no_name.result().unwrap().unwrap_err().kind, ErrorKind::MissingParameter);

        let no_window = pair.parent.request(RequestOptions {
            name: "ping".to_string(),
            ..RequestOptions::default()
        });
        assert_eq!(no_window.result().unwrap().unwrap_err().kind, ErrorKind::MissingParameter);
    }

    #[test]
    fn test_element_target_must_be_iframe() {
        let pair = frame_pair(MessagingConfig::default());
        pair.browser.add_element(pair.top, "pay-button", "BUTTON").unwrap();
        pair.child.on("ping", ListenerOptions::default(), |_| json!("pong")).unwrap();

        let by_frame = pair.parent.send("button", "ping", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &by_frame).unwrap().data, json!("pong"));

        let by_button = pair.parent.send("pay-button", "ping", Value::Null, SendOptions::default());
        assert_eq!(by_button.result().unwrap().unwrap_err().kind, ErrorKind::InvalidTarget);

        let missing = pair.parent.send("nothing", "ping", Value::Null, SendOptions::default());
        assert_eq!(missing.result().unwrap().unwrap_err().kind, ErrorKind::InvalidTarget);
    }

    #[test]
    fn test_closed_target_is_invalid() {
        let pair = frame_pair(MessagingConfig::default());
        pair.browser.close(pair.frame);
        let reply = pair.parent.send(pair.frame, "ping", Value::Null, SendOptions::default());
        assert_eq!(reply.result().unwrap().unwrap_err().kind, ErrorKind::InvalidTarget);
    }

    #[test]
    fn test_fire_and_forget_resolves_without_answer() {
        let pair = frame_pair(MessagingConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        pair.child
            .on("log", ListenerOptions::default(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let sent = pair.parent.send(
            pair.frame,
            "log",
            json!("line"),
            SendOptions::default().fire_and_forget(),
        );
        let event = sent.result().unwrap().unwrap();
        assert_eq!(event.source, pair.frame);
        assert_eq!(event.data, Value::Null);
        assert_eq!(pair.parent.pending_requests(), 0);

        pair.browser.event_loop().run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_response_timeout_after_ack() {
        let pair = frame_pair(MessagingConfig::default());
        pair.child
            .on("stall", ListenerOptions::default(), |_| Deferred::<Value>::new())
            .unwrap();

        let reply = pair.parent.request(RequestOptions::new(pair.frame, "stall").with_timeout(200));
        let error = wait(&pair.browser, &reply).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ResponseTimeout);
    }

    #[test]
    fn test_child_that_never_announces_times_out() {
        let browser = Browser::new();
        let top = browser.open_window("https://merchant.com");
        let config = MessagingConfig::default().with_child_window_timeout(300);
        let parent = Messenger::install(&browser, top, config).unwrap();
        let frame = browser.open_frame(top, "https://pay.com/blank", "blank").unwrap();

        let reply = parent.send(frame, "ping", Value::Null, SendOptions::default());
        let error = wait(&browser, &reply).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ReadyTimeout);
        assert_eq!(browser.event_loop().now(), 300);
    }

    #[test]
    fn test_send_to_parent() {
        let pair = frame_pair(MessagingConfig::default());
        pair.parent
            .on("resize", ListenerOptions::default(), |event| event.data)
            .unwrap();

        let reply = pair
            .child
            .send_to_parent("resize", json!({ "height": 40 }), SendOptions::default());
        let event = wait(&pair.browser, &reply).unwrap();
        assert_eq!(event.source, pair.top);
        assert_eq!(event.data, json!({ "height": 40 }));

        let orphan = pair.parent.send_to_parent("resize", Value::Null, SendOptions::default());
        assert_eq!(orphan.result().unwrap().unwrap_err().kind, ErrorKind::InvalidTarget);
    }

    #[test]
    fn test_send_to_parent_from_popup_reaches_opener() {
        let browser = Browser::new();
        let merchant = browser.open_window("https://merchant.com");
        let opener = Messenger::install(&browser, merchant, MessagingConfig::default()).unwrap();
        let popup = opener.open_popup("https://pay.com/checkout", "checkout").unwrap();
        let checkout = Messenger::install(&browser, popup, MessagingConfig::default()).unwrap();
        opener.on("paid", ListenerOptions::default(), |event| event.data).unwrap();

        let reply = checkout.send_to_parent("paid", json!({ "amount": 5 }), SendOptions::default());
        let event = wait(&browser, &reply).unwrap();
        assert_eq!(event.source, merchant);
        assert_eq!(event.data, json!({ "amount": 5 }));
    }
}

#[cfg(test)]
mod listener_tests {
    use super::*;

    #[test]
    fn test_duplicate_listener_requires_override() {
        let pair = frame_pair(MessagingConfig::default());
        pair.child.on("ping", ListenerOptions::default(), |_| json!(1)).unwrap();

        let duplicate = pair.child.on("ping", ListenerOptions::default(), |_| json!(2));
        assert_eq!(duplicate.unwrap_err().kind, ErrorKind::ListenerExists);

        pair.child
            .on("ping", ListenerOptions::default().override_existing(), |_| json!(2))
            .unwrap();
        let reply = pair.parent.send(pair.frame, "ping", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &reply).unwrap().data, json!(2));
    }

    #[test]
    fn test_window_specific_listener_ignores_other_windows() {
        let pair = frame_pair(MessagingConfig::default());
        let stranger = pair.browser.open_window("https://other.com");
        pair.child
            .on("ping", ListenerOptions::default().window(stranger), |_| json!("pong"))
            .unwrap();

        let reply = pair.parent.send(pair.frame, "ping", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &reply).unwrap_err().kind, ErrorKind::NoHandler);
    }

    #[test]
    fn test_listener_domain_is_enforced() {
        let pair = frame_pair(MessagingConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        pair.child
            .on(
                "secret",
                ListenerOptions::default().domain("https://trusted.com"),
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    json!("secret")
                },
            )
            .unwrap();

        let reply = pair.parent.send(pair.frame, "secret", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &reply).unwrap_err().kind, ErrorKind::DomainMismatch);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_once_fires_once() {
        let pair = frame_pair(MessagingConfig::default());
        let once = pair
            .child
            .once("init", ListenerOptions::default(), |_| json!("first"))
            .unwrap();
        assert!(once.is_pending());

        let first = pair.parent.send(pair.frame, "init", json!(7), SendOptions::default());
        assert_eq!(wait(&pair.browser, &first).unwrap().data, json!("first"));
        let fired = once.result().unwrap().unwrap();
        assert_eq!(fired.source, pair.top);
        assert_eq!(fired.data, json!(7));

        let second = pair.parent.send(pair.frame, "init", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &second).unwrap_err().kind, ErrorKind::NoHandler);
        assert!(!once.cancel());
    }

    #[test]
    fn test_once_survives_request_from_foreign_domain() {
        let pair = frame_pair(MessagingConfig::default());
        let once = pair
            .child
            .once(
                "init",
                ListenerOptions::default().domain("https://merchant.com"),
                |_| json!("ok"),
            )
            .unwrap();

        let intruder = pair.browser.open_window("https://evil.com");
        let stamp = Stamp {
            source_domain: "https://evil.com".to_string(),
            window_type: WindowType::Fullpage,
        };
        let request = Envelope::request(&stamp, "init", "init_intruder", Value::Null, "*", false);
        pair.browser
            .post_message(intruder, pair.frame, request.to_wire(), "*")
            .unwrap();
        pair.browser.event_loop().run_until_idle();
        assert!(once.is_pending());

        let reply = pair.parent.send(pair.frame, "init", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &reply).unwrap().data, json!("ok"));
        assert_eq!(once.result().unwrap().unwrap().source, pair.top);
        assert!(!once.cancel());
    }

    #[test]
    fn test_cancelled_listener_stops_answering() {
        let pair = frame_pair(MessagingConfig::default());
        let handle = pair.child.on("ping", ListenerOptions::default(), |_| json!(1)).unwrap();
        assert_eq!(handle.name(), "ping");
        assert!(handle.cancel());
        assert!(!handle.cancel());

        let reply = pair.parent.send(pair.frame, "ping", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &reply).unwrap_err().kind, ErrorKind::NoHandler);
    }

    #[test]
    fn test_error_handler_sees_failures() {
        let pair = frame_pair(MessagingConfig::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        pair.child
            .on(
                "fail",
                ListenerOptions::default()
                    .on_error(move |error| sink.lock().unwrap().push(error.kind)),
                |_| -> MessageResult<()> { Err(MessageError::handler("nope")) },
            )
            .unwrap();

        let reply = pair.parent.send(pair.frame, "fail", Value::Null, SendOptions::default());
        assert!(wait(&pair.browser, &reply).is_err());
        assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::HandlerError]);
    }
}

#[cfg(test)]
mod dispatcher_tests {
    use super::*;

    fn merchant_stamp() -> Stamp {
        Stamp {
            source_domain: "https://merchant.com".to_string(),
            window_type: WindowType::Fullpage,
        }
    }

    #[test]
    fn test_same_id_is_dispatched_once() {
        let pair = frame_pair(MessagingConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        pair.child
            .on("hit", ListenerOptions::default(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let envelope = Envelope::request(&merchant_stamp(), "hit", "hit_1", Value::Null, "*", true);
        pair.browser.post_message(pair.top, pair.frame, envelope.to_wire(), "*").unwrap();
        pair.browser.post_message(pair.top, pair.frame, envelope.to_wire(), "*").unwrap();
        pair.browser.event_loop().run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let another = Envelope::request(&merchant_stamp(), "hit", "hit_1", Value::Null, "*", true);
        pair.browser.post_message(pair.top, pair.frame, another.to_wire(), "*").unwrap();
        pair.browser.event_loop().run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_foreign_messages_are_ignored() {
        let pair = frame_pair(MessagingConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        pair.child
            .on("hit", ListenerOptions::default(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let junk_messages = [
            json!("hello"),
            json!({ "type": "REQUEST", "name": "hit" }),
            json!("{broken"),
        ];
        for junk in junk_messages {
            pair.browser.post_message(pair.top, pair.frame, junk, "*").unwrap();
        }
        pair.browser.event_loop().run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_response_origin_must_match_request_domain() {
        let pair = frame_pair(MessagingConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        pair.child
            .on("quote", ListenerOptions::default(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                json!({ "price": 10 })
            })
            .unwrap();

        let trusted = DomainMatcher::pattern(r"^https://trusted\.com$").unwrap();
        let reply = pair
            .parent
            .request(RequestOptions::new(pair.frame, "quote").with_domain(trusted));
        let error = wait(&pair.browser, &reply).unwrap_err();
        assert_eq!(error.kind, ErrorKind::DomainMismatch);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_page_is_answered() {
        let pair = frame_pair_at("file:///home/user/index.html", MessagingConfig::default());
        let origins = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&origins);
        pair.child
            .on("ping", ListenerOptions::default(), move |event| {
                sink.lock().unwrap().push(event.origin);
                json!("pong")
            })
            .unwrap();

        let reply = pair.parent.send(pair.frame, "ping", Value::Null, SendOptions::default());
        assert_eq!(wait(&pair.browser, &reply).unwrap().data, json!("pong"));
        assert_eq!(*origins.lock().unwrap(), vec!["file://".to_string()]);
    }

    #[test]
    fn test_mock_mode_trusts_mock_domain() {
        let config = MessagingConfig::default()
            .with_mock_mode(true)
            .with_allow_postmessage_popup(false);
        let pair = frame_pair(config);
        pair.child.on("ping", ListenerOptions::default(), |event| json!(event.origin)).unwrap();

        let reply = pair.parent.send(pair.frame, "ping", Value::Null, SendOptions::default());
        let event = wait(&pair.browser, &reply).unwrap();
        assert_eq!(event.data, json!("mock://merchant.com"));
        assert_eq!(event.origin, "mock://pay.com");
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;

    fn popup_pair(
        config: MessagingConfig,
    ) -> (Arc<Browser>, WindowId, WindowId, Messenger, Messenger) {
        let browser = Browser::new();
        let merchant = browser.open_window("https://merchant.com");
        let opener = Messenger::install(&browser, merchant, config.clone()).unwrap();
        let popup = opener.open_popup("https://pay.com/checkout", "checkout").unwrap();
        let checkout = Messenger::install(&browser, popup, config).unwrap();
        browser.event_loop().run_until_idle();
        (browser, merchant, popup, opener, checkout)
    }

    #[test]
    fn test_direct_send_between_popup_and_opener() {
        let (browser, merchant, _, opener, checkout) = popup_pair(MessagingConfig::default());
        opener.on("done", ListenerOptions::default(), |_| json!("ok")).unwrap();

        let reply = checkout.send(merchant, "done", Value::Null, SendOptions::default());
        assert_eq!(wait(&browser, &reply).unwrap().data, json!("ok"));
        let failed: Vec<String> = checkout
            .diagnostics()
            .iter()
            .map(|failure| failure.strategy.clone())
            .collect();
        assert!(failed.iter().all(|strategy| strategy == "bridge"));
    }

    #[test]
    fn test_all_strategies_failing_lists_every_reason() {
        let config = MessagingConfig::default().with_allow_postmessage_popup(false);
        let (browser, merchant, _, _, checkout) = popup_pair(config);

        let reply = checkout.send(merchant, "done", Value::Null, SendOptions::default());
        let error = wait(&browser, &reply).unwrap_err();
        assert_eq!(error.kind, ErrorKind::AllStrategiesFailed);
        assert_eq!(error.details.len(), 2);
        assert!(error.details[0].contains("Post message through popup disabled"));
        assert!(error.details[1].starts_with("bridge:"));
    }

    #[test]
    fn test_no_enabled_strategy() {
        let config = MessagingConfig::default().with_send_strategies(false, false);
        let pair = frame_pair(config);
        let reply = pair.child.send_to_parent("ping", Value::Null, SendOptions::default());
        let error = reply.result().unwrap().unwrap_err();
        assert_eq!(error.kind, ErrorKind::AllStrategiesFailed);
        assert!(error.details.is_empty());
    }

    #[test]
    fn test_bridge_required() {
        let browser = Browser::new();
        let merchant = browser.open_window("https://merchant.com");
        let strict = Messenger::install(
            &browser,
            merchant,
            MessagingConfig::default().with_allow_postmessage_popup(false),
        )
        .unwrap();
        assert!(strict.bridge_required("https://pay.com/checkout", None));
        assert!(!strict.bridge_required("https://merchant.com/other", None));
        assert!(strict.bridge_required("ignored", Some("https://pay.com")));

        let other = browser.open_window("https://merchant.com");
        let relaxed = Messenger::install(&browser, other, MessagingConfig::default()).unwrap();
        assert!(!relaxed.bridge_required("https://pay.com/checkout", None));

        let trident = "Mozilla/5.0 (Windows NT 10.0; Trident/7.0; rv:11.0) like Gecko";
        let legacy = Browser::with_user_agent(trident);
        let page = legacy.open_window("https://merchant.com");
        let old = Messenger::install(&legacy, page, MessagingConfig::default()).unwrap();
        assert!(old.bridge_required("https://pay.com/checkout", None));

        let no_bridge = browser.open_window("https://merchant.com");
        let disabled = Messenger::install(
            &browser,
            no_bridge,
            MessagingConfig::default()
                .with_allow_postmessage_popup(false)
                .with_send_strategies(true, false),
        )
        .unwrap();
        assert!(!disabled.bridge_required("https://pay.com/checkout", None));
    }
}

#[cfg(test)]
mod bridge_tests {
    use super::*;

    #[test]
    fn test_bridge_is_opened_once_per_domain() {
        let browser = Browser::new();
        browser.serve("https://pay.com/bridge", bridge::bridge_page(MessagingConfig::default()));
        let merchant = browser.open_window("https://merchant.com");
        let messenger = Messenger::install(&browser, merchant, MessagingConfig::default()).unwrap();

        let first = messenger.open_bridge("https://pay.com/bridge", None);
        let frame = wait(&browser, &first).unwrap();
        assert_eq!(
            browser.proxy(merchant, merchant).frame_named(&bridge::bridge_name("https://pay.com")),
            Ok(Some(frame))
        );

        let second = messenger.open_bridge("https://pay.com/bridge?v=2", Some("https://pay.com"));
        assert_eq!(second.result(), Some(Ok(frame)));
        assert_eq!(browser.proxy(merchant, merchant).frames().unwrap(), vec![frame]);
    }

    #[test]
    fn test_bridge_that_never_loads_fails() {
        let browser = Browser::new();
        let merchant = browser.open_window("https://merchant.com");
        let config = MessagingConfig::default().with_bridge_timeout(500);
        let messenger = Messenger::install(&browser, merchant, config).unwrap();

        let bridge = messenger.open_bridge("https://pay.com/missing", None);
        let error = wait(&browser, &bridge).unwrap_err();
        assert_eq!(error.kind, ErrorKind::BridgeNegotiationFailed);
        assert_eq!(browser.event_loop().now(), 500);
        assert!(browser.proxy(merchant, merchant).frames().unwrap().is_empty());
    }

    /// A merchant on merchant.com with its pay.com bridge loaded, where
    /// direct posting to popups is disabled.
    fn merchant_with_bridge() -> (Arc<Browser>, WindowId, Messenger) {
        let browser = Browser::new();
        let config = MessagingConfig::default().with_allow_postmessage_popup(false);
        browser.serve("https://pay.com/bridge", bridge::bridge_page(config.clone()));
        let checkout_config = config.clone();
        browser.serve("https://pay.com/checkout", move |browser, window| {
            Messenger::install(browser, window, checkout_config.clone()).unwrap();
        });
        let top = browser.open_window("https://merchant.com");
        let merchant = Messenger::install(&browser, top, config).unwrap();
        let bridge = merchant.open_bridge("https://pay.com/bridge", None);
        wait(&browser, &bridge).unwrap();
        (browser, top, merchant)
    }

    fn tunnel_from(browser: &Arc<Browser>, popup: WindowId) -> MessageResult<()> {
        browser.event_loop().run_until_idle();
        let checkout = Messenger::for_window(browser, popup).expect("Checkout should be installed");
        wait(browser, &checkout.open_tunnel_to_opener())
    }

    #[test]
    fn test_tunnel_from_registered_popup_is_accepted() {
        let (browser, _, merchant) = merchant_with_bridge();
        let popup = merchant.open_popup("https://pay.com/checkout", "checkout").unwrap();
        assert_eq!(tunnel_from(&browser, popup), Ok(()));
        assert!(browser.event_loop().run_until(1000, || merchant.is_ready(popup)));
    }

    #[test]
    fn test_tunnel_from_unknown_popup_is_refused() {
        let (browser, top, merchant) = merchant_with_bridge();
        let popup = browser.open_popup(top, "https://pay.com/checkout", "sneaky").unwrap();

        let error = tunnel_from(&browser, popup).unwrap_err();
        assert_eq!(error.kind, ErrorKind::BridgeNegotiationFailed);
        assert!(error.message.contains("sneaky"));
        assert!(!merchant.is_ready(popup));
    }

    #[test]
    fn test_tunnel_from_popup_on_other_domain_is_refused() {
        let (browser, top, merchant) = merchant_with_bridge();
        let popup = browser.open_popup(top, "https://pay.com/checkout", "checkout").unwrap();
        merchant.register_popup(popup, "checkout", "https://other.com");

        let error = tunnel_from(&browser, popup).unwrap_err();
        assert_eq!(error.kind, ErrorKind::BridgeNegotiationFailed);
        assert!(error.message.contains("https://other.com"));
    }

    #[test]
    fn test_tunnel_request_not_from_bridge_frame_is_refused() {
        let (browser, top, merchant) = merchant_with_bridge();
        merchant.open_popup("https://pay.com/checkout", "checkout").unwrap();
        let frame = browser.open_frame(top, "https://pay.com/button", "button").unwrap();
        let button = Messenger::install(&browser, frame, MessagingConfig::default()).unwrap();

        let reply = button.request(
            RequestOptions::new(top, window_messaging::envelope::OPEN_TUNNEL_MESSAGE)
                .with_data(json!({ "name": "checkout" })),
        );
        let error = wait(&browser, &reply).unwrap_err();
        assert_eq!(error.kind, ErrorKind::BridgeNegotiationFailed);
        assert!(error.message.contains("not the bridge frame"));
    }

    #[test]
    fn test_unparsable_bridge_url() {
        let browser = Browser::new();
        let merchant = browser.open_window("https://merchant.com");
        let messenger = Messenger::install(&browser, merchant, MessagingConfig::default()).unwrap();
        let bridge = messenger.open_bridge("not a url", None);
        assert_eq!(bridge.result().unwrap().unwrap_err().kind, ErrorKind::InvalidTarget);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        let pair = frame_pair(MessagingConfig::default());
        let again =
            Messenger::install(&pair.browser, pair.frame, MessagingConfig::default()).unwrap();
        pair.child.on("ping", ListenerOptions::default(), |_| json!(1)).unwrap();
        let duplicate = again.on("ping", ListenerOptions::default(), |_| json!(2));
        assert_eq!(duplicate.unwrap_err().kind, ErrorKind::ListenerExists);
        assert_eq!(
            Messenger::for_window(&pair.browser, pair.frame).map(|m| m.window()),
            Some(pair.frame)
        );
    }

    #[test]
    fn test_children_announce_readiness() {
        let pair = frame_pair(MessagingConfig::default());
        assert!(pair.parent.is_ready(pair.frame));
        assert!(!pair.child.is_ready(pair.top));
    }

    #[test]
    fn test_destroy_rejects_pending_requests() {
        let pair = frame_pair(MessagingConfig::default());
        pair.child
            .on("stall", ListenerOptions::default(), |_| Deferred::<Value>::new())
            .unwrap();

        let reply = pair.parent.send(pair.frame, "stall", Value::Null, SendOptions::default());
        pair.browser.event_loop().advance(10);
        assert!(reply.is_pending());

        pair.parent.destroy();
        assert_eq!(reply.result().unwrap().unwrap_err().kind, ErrorKind::Destroyed);
        assert!(Messenger::for_window(&pair.browser, pair.top).is_none());

        let after = pair.parent.send(pair.frame, "stall", Value::Null, SendOptions::default());
        assert_eq!(after.result().unwrap().unwrap_err().kind, ErrorKind::Destroyed);
        let listener = pair.parent.on("x", ListenerOptions::default(), |_| ());
        assert_eq!(listener.unwrap_err().kind, ErrorKind::Destroyed);
    }

    #[test]
    fn test_navigation_discards_messenger() {
        let pair = frame_pair(MessagingConfig::default());
        pair.browser.navigate(pair.frame, "https://pay.com/next").unwrap();
        assert!(Messenger::for_window(&pair.browser, pair.frame).is_none());
    }
}
