mod support;

use serde_json::json;
use support::{FakeDocument, FakeNode, context, register};
use tabrelay_engine::catalog::{self, execute_with_retry};
use tabrelay_engine::document::{DragEventName, EventTarget, MouseEventName, SyntheticEvent};
use tabrelay_engine::element::{ElementDescriptor, Rect, SelectorType};
use tabrelay_engine::error::InstructionError;
use tabrelay_engine::instruction::*;
use std::time::Duration;

fn click(id: &str, name: &str) -> Instruction {
    Instruction::new(
        id,
        InstructionKind::Click(ClickPayload {
            element_name: name.into(),
            offset_x: 0.0,
            offset_y: 0.0,
            double: false,
        }),
    )
}

fn wait(mode: WaitMode) -> WaitPayload {
    WaitPayload {
        mode,
        seconds: None,
        element_name: None,
        script: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_runs_exactly_retry_count_attempts() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);
    register(&ctx, "ghost", "#ghost");

    let result = catalog::execute(&click("c1", "ghost").with_retry_count(3), &ctx).await;

    assert!(!result.success);
    assert_eq!(doc.queries("#ghost"), 3);
    assert!(result.error.unwrap().contains("Element not found"));
}

#[tokio::test(start_paused = true)]
async fn test_zero_retry_count_still_attempts_once() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);
    register(&ctx, "ghost", "#ghost");

    let result = catalog::execute(&click("c1", "ghost").with_retry_count(0), &ctx).await;

    assert!(!result.success);
    assert_eq!(doc.queries("#ghost"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_backoff_between_attempts() {
    let started = tokio::time::Instant::now();
    let mut calls = 0;
    let outcome: Result<(), InstructionError> =
        execute_with_retry(3, Duration::from_secs(1), |_| {
            calls += 1;
            async { Err(InstructionError::Timeout("never".into())) }
        })
        .await;

    assert!(matches!(outcome, Err(InstructionError::Timeout(_))));
    assert_eq!(calls, 3);
    // Two pauses: none after the final attempt.
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_on_later_attempt() {
    let outcome = execute_with_retry(5, Duration::from_millis(10), |attempt| async move {
        if attempt < 3 {
            Err(InstructionError::ElementNotFound("x".into()))
        } else {
            Ok(attempt)
        }
    })
    .await;
    assert_eq!(outcome.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_has_no_side_effects() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);

    let bad = Instruction::new(
        "n1",
        InstructionKind::Navigate(NavigatePayload {
            url: "not a url".into(),
        }),
    )
    .with_retry_count(3)
    .with_delay(5.0);

    let started = tokio::time::Instant::now();
    let result = catalog::execute(&bad, &ctx).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("Invalid instruction"));
    assert!(doc.with_state(|s| s.navigations.is_empty()));
    // Neither delayed nor retried.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_pre_delay_is_applied() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);
    let nav = Instruction::new(
        "n1",
        InstructionKind::Navigate(NavigatePayload {
            url: "https://example.org/next".into(),
        }),
    )
    .with_delay(1.5);

    let result = catalog::execute(&nav, &ctx).await;

    assert!(result.success);
    assert!(result.duration_ms >= 1500);
    assert_eq!(doc.with_state(|s| s.url.clone()), "https://example.org/next");
}

#[tokio::test(start_paused = true)]
async fn test_click_dispatches_sequence_at_offset_center() {
    let doc = FakeDocument::new();
    let node = doc.add(1, "#submit", FakeNode::new("button", Rect::new(10.0, 20.0, 100.0, 50.0)));
    let ctx = context(&doc);
    register(&ctx, "submit", "#submit");

    let mut instr = click("c1", "submit");
    if let InstructionKind::Click(p) = &mut instr.kind {
        p.offset_x = 5.0;
        p.offset_y = 5.0;
    }
    let result = catalog::execute(&instr, &ctx).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data, Some(json!({ "x": 65.0, "y": 50.0, "double": false })));
    assert_eq!(doc.event_names(), vec!["mousedown", "mouseup", "click"]);
    for (target, event) in doc.events() {
        assert_eq!(target, EventTarget::node(node));
        if let SyntheticEvent::Mouse { x, y, .. } = event {
            assert_eq!((x, y), (65.0, 50.0));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_double_click_sequence() {
    let doc = FakeDocument::new();
    doc.add(1, "#row", FakeNode::new("div", Rect::new(0.0, 0.0, 40.0, 40.0)));
    let ctx = context(&doc);
    register(&ctx, "row", "#row");

    let mut instr = click("c1", "row");
    if let InstructionKind::Click(p) = &mut instr.kind {
        p.double = true;
    }
    assert!(catalog::execute(&instr, &ctx).await.success);

    assert_eq!(
        doc.event_names(),
        vec!["mousedown", "mouseup", "click", "mousedown", "mouseup", "click", "dblclick"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_click_scrolls_offscreen_element_into_view() {
    let doc = FakeDocument::new();
    let mut far = FakeNode::new("button", Rect::new(10.0, 5000.0, 80.0, 30.0));
    far.scrolled_rect = Some(Rect::new(10.0, 300.0, 80.0, 30.0));
    let node = doc.add(1, "#far", far);
    let ctx = context(&doc);
    register(&ctx, "far", "#far");

    let result = catalog::execute(&click("c1", "far"), &ctx).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(doc.with_state(|s| s.scrolled.clone()), vec![node]);
    assert_eq!(result.data.unwrap()["y"], 315.0);
}

#[tokio::test(start_paused = true)]
async fn test_click_times_out_on_hidden_element() {
    let doc = FakeDocument::new();
    let mut hidden = FakeNode::new("button", Rect::new(0.0, 0.0, 10.0, 10.0));
    hidden.style.display = "none".into();
    doc.add(1, "#hidden", hidden);
    let ctx = context(&doc);
    register(&ctx, "hidden", "#hidden");

    let result = catalog::execute(&click("c1", "hidden").with_timeout(2.0), &ctx).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("Timed out"));
    assert!(result.duration_ms >= 2000);
    assert!(doc.event_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_click_without_visibility_wait_skips_check() {
    let doc = FakeDocument::new();
    let mut hidden = FakeNode::new("button", Rect::new(0.0, 0.0, 10.0, 10.0));
    hidden.style.visibility = "hidden".into();
    doc.add(1, "#hidden", hidden);
    let ctx = context(&doc);
    register(&ctx, "hidden", "#hidden");

    let result = catalog::execute(&click("c1", "hidden").with_wait_for_visible(false), &ctx).await;

    assert!(result.success);
    assert_eq!(doc.event_names().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_drag_protocol_order_and_cleanup() {
    let doc = FakeDocument::new();
    let mut card = FakeNode::new("div", Rect::new(0.0, 0.0, 20.0, 20.0));
    card.attributes.insert("draggable".into(), "false".into());
    let source = doc.add(1, "#card", card);
    let target = doc.add(2, "#lane", FakeNode::new("div", Rect::new(200.0, 0.0, 100.0, 100.0)));
    let ctx = context(&doc);
    register(&ctx, "card", "#card");
    register(&ctx, "lane", "#lane");

    let instr = Instruction::new(
        "d1",
        InstructionKind::Drag(DragPayload {
            source_name: "card".into(),
            target_name: "lane".into(),
            duration: 0.5,
        }),
    );
    let result = catalog::execute(&instr, &ctx).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data.as_ref().unwrap()["steps"], 5);

    let names = doc.event_names();
    let mut expected = vec!["mousedown".to_string(), "dragstart".to_string()];
    for _ in 0..5 {
        expected.push("mousemove".into());
        expected.push("dragover".into());
    }
    for name in ["dragenter", "dragover", "mouseup", "drop", "dragend", "click"] {
        expected.push(name.into());
    }
    assert_eq!(names, expected);

    let events = doc.events();
    assert_eq!(events[0].0, EventTarget::node(source));
    let (last_move_target, _) = &events[10];
    assert_eq!(*last_move_target, EventTarget::AtPoint { x: 250.0, y: 50.0 });
    assert!(matches!(
        events[events.len() - 2],
        (t, SyntheticEvent::Drag { name: DragEventName::DragEnd, .. }) if t == EventTarget::node(source)
    ));
    assert!(matches!(
        events[events.len() - 1],
        (t, SyntheticEvent::Mouse { name: MouseEventName::Click, .. }) if t == EventTarget::node(target)
    ));

    doc.with_state(|s| {
        assert_eq!(s.listeners_installed, 2);
        assert!(s.listeners.is_empty());
        assert_eq!(s.transfers, vec!["card".to_string()]);
    });
    assert_eq!(
        doc.node(source).attributes.get("draggable").map(String::as_str),
        Some("false")
    );
}

#[tokio::test(start_paused = true)]
async fn test_drag_cleanup_runs_on_failure() {
    let doc = FakeDocument::new();
    let source = doc.add(1, "#card", FakeNode::new("div", Rect::new(0.0, 0.0, 20.0, 20.0)));
    doc.add(2, "#lane", FakeNode::new("div", Rect::new(200.0, 0.0, 100.0, 100.0)));
    doc.with_state(|s| s.fail_dispatch_of = Some("drop".into()));
    let ctx = context(&doc);
    register(&ctx, "card", "#card");
    register(&ctx, "lane", "#lane");

    let instr = Instruction::new(
        "d1",
        InstructionKind::Drag(DragPayload {
            source_name: "card".into(),
            target_name: "lane".into(),
            duration: 0.0,
        }),
    );
    let result = catalog::execute(&instr, &ctx).await;

    assert!(!result.success);
    doc.with_state(|s| assert!(s.listeners.is_empty()));
    assert!(!doc.node(source).attributes.contains_key("draggable"));
}

#[tokio::test(start_paused = true)]
async fn test_input_text_types_each_character() {
    let doc = FakeDocument::new();
    let mut field = FakeNode::input(Rect::new(0.0, 0.0, 200.0, 30.0));
    field.value = "old".into();
    let node = doc.add(1, "#q", field);
    let ctx = context(&doc);
    register(&ctx, "query", "#q");

    let instr = Instruction::new(
        "t1",
        InstructionKind::InputText(InputTextPayload {
            element_name: "query".into(),
            text: "hi".into(),
            clear_first: true,
            char_delay_ms: 50,
        }),
    );
    let result = catalog::execute(&instr, &ctx).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(doc.node(node).value, "hi");
    assert_eq!(
        doc.event_names(),
        vec![
            "input", // clear
            "keydown", "beforeinput", "input", "keyup", //
            "keydown", "beforeinput", "input", "keyup", //
            "change",
        ]
    );
    assert_eq!(doc.with_state(|s| s.focused.clone()), vec![node]);
    assert!(result.duration_ms >= 50);
}

#[tokio::test(start_paused = true)]
async fn test_input_text_rejects_non_editable() {
    let doc = FakeDocument::new();
    doc.add(1, "#box", FakeNode::input(Rect::new(0.0, 0.0, 20.0, 20.0)));
    doc.with_state(|s| {
        s.nodes.get_mut(&tabrelay_engine::element::NodeHandle(1)).unwrap().info.input_type =
            Some("checkbox".into())
    });
    let ctx = context(&doc);
    register(&ctx, "box", "#box");

    let instr = Instruction::new(
        "t1",
        InstructionKind::InputText(InputTextPayload {
            element_name: "box".into(),
            text: "x".into(),
            clear_first: false,
            char_delay_ms: 0,
        }),
    );
    let result = catalog::execute(&instr, &ctx).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("not editable"));
    assert!(doc.event_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_key_press_with_shift_inserts_uppercase() {
    let doc = FakeDocument::new();
    let node = doc.add(1, "#q", FakeNode::input(Rect::new(0.0, 0.0, 200.0, 30.0)));
    let ctx = context(&doc);
    register(&ctx, "query", "#q");

    let instr = Instruction::new(
        "k1",
        InstructionKind::KeyPress(KeyPressPayload {
            element_name: "query".into(),
            key: "a".into(),
            modifiers: vec![Modifier::Shift],
        }),
    );
    let result = catalog::execute(&instr, &ctx).await;

    assert!(result.success);
    assert_eq!(doc.node(node).value, "A");
    assert_eq!(
        doc.event_names(),
        vec!["keydown", "beforeinput", "input", "keyup", "change"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_key_press_chord_does_not_insert() {
    let doc = FakeDocument::new();
    let node = doc.add(1, "#q", FakeNode::input(Rect::new(0.0, 0.0, 200.0, 30.0)));
    let ctx = context(&doc);
    register(&ctx, "query", "#q");

    let instr = Instruction::new(
        "k1",
        InstructionKind::KeyPress(KeyPressPayload {
            element_name: "query".into(),
            key: "a".into(),
            modifiers: vec![Modifier::Ctrl],
        }),
    );
    assert!(catalog::execute(&instr, &ctx).await.success);

    assert_eq!(doc.node(node).value, "");
    assert_eq!(doc.event_names(), vec!["keydown", "keyup", "change"]);
}

#[tokio::test(start_paused = true)]
async fn test_key_press_on_plain_element_has_no_change() {
    let doc = FakeDocument::new();
    doc.add(1, "#menu", FakeNode::new("div", Rect::new(0.0, 0.0, 50.0, 50.0)));
    let ctx = context(&doc);
    register(&ctx, "menu", "#menu");

    let instr = Instruction::new(
        "k1",
        InstructionKind::KeyPress(KeyPressPayload {
            element_name: "menu".into(),
            key: "Escape".into(),
            modifiers: vec![],
        }),
    );
    assert!(catalog::execute(&instr, &ctx).await.success);
    assert_eq!(doc.event_names(), vec!["keydown", "keyup"]);
}

#[tokio::test(start_paused = true)]
async fn test_wait_time_takes_at_least_requested_duration() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);

    let mut payload = wait(WaitMode::Time);
    payload.seconds = Some(2.0);
    let result = catalog::execute(&Instruction::new("w1", InstructionKind::Wait(payload)), &ctx).await;

    assert!(result.success);
    assert!(result.duration_ms >= 2000);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_wait_fails_validation() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);

    let mut payload = wait(WaitMode::Time);
    payload.seconds = Some(1e20);
    let started = tokio::time::Instant::now();
    let result = catalog::execute(&Instruction::new("w1", InstructionKind::Wait(payload)), &ctx).await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("Invalid instruction"), "{}", error);
    assert!(!error.contains("panicked"));
    assert!(started.elapsed() < Duration::from_secs(1));

    let slow = click("c1", "ghost").with_timeout(1e30);
    let result = catalog::execute(&slow, &ctx).await;
    assert!(result.error.unwrap().contains("Invalid instruction"));
}

#[tokio::test(start_paused = true)]
async fn test_wait_network_never_fails() {
    let doc = FakeDocument::new();
    doc.with_state(|s| s.pending_resources = vec![3].into());
    let ctx = context(&doc);

    let instr = Instruction::new("w1", InstructionKind::Wait(wait(WaitMode::Network))).with_timeout(2.0);
    let result = catalog::execute(&instr, &ctx).await;

    assert!(result.success);
    assert_eq!(result.data.unwrap()["settled"], false);
}

#[tokio::test(start_paused = true)]
async fn test_wait_network_settles_after_quiet_interval() {
    let doc = FakeDocument::new();
    doc.with_state(|s| s.pending_resources = vec![2, 1, 0].into());
    let ctx = context(&doc);

    let instr = Instruction::new("w1", InstructionKind::Wait(wait(WaitMode::Network))).with_timeout(10.0);
    let result = catalog::execute(&instr, &ctx).await;

    assert!(result.success);
    let data = result.data.unwrap();
    assert_eq!(data["settled"], true);
    assert!(data["waitedMs"].as_u64().unwrap() >= 500);
    assert!(result.duration_ms < 10_000);
}

#[tokio::test(start_paused = true)]
async fn test_wait_condition_swallows_predicate_errors() {
    let doc = FakeDocument::new();
    doc.with_state(|s| {
        s.predicate_results = vec![
            Err(tabrelay_engine::error::DocumentError::Script("ReferenceError".into())),
            Ok(false),
            Ok(true),
        ]
        .into()
    });
    let ctx = context(&doc);

    let mut payload = wait(WaitMode::Condition);
    payload.script = Some("window.ready === true".into());
    let result = catalog::execute(&Instruction::new("w1", InstructionKind::Wait(payload)), &ctx).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(doc.with_state(|s| s.predicate_calls), 3);
}

#[tokio::test(start_paused = true)]
async fn test_wait_function_times_out() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);

    let mut payload = wait(WaitMode::Function);
    payload.script = Some("return false;".into());
    let instr = Instruction::new("w1", InstructionKind::Wait(payload)).with_timeout(1.0);
    let result = catalog::execute(&instr, &ctx).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("Timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_wait_element_sees_late_node() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);
    register(&ctx, "toast", "#toast");

    let late = doc.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(450)).await;
        late.add(9, "#toast", FakeNode::new("div", Rect::new(0.0, 0.0, 10.0, 10.0)));
    });

    let mut payload = wait(WaitMode::Element);
    payload.element_name = Some("toast".into());
    let result = catalog::execute(&Instruction::new("w1", InstructionKind::Wait(payload)), &ctx).await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.duration_ms >= 450);
    assert!(ctx.registry.get("toast").unwrap().cached_handle().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_wait_visible_fails_for_hidden_node() {
    let doc = FakeDocument::new();
    let mut hidden = FakeNode::new("div", Rect::new(0.0, 0.0, 10.0, 10.0));
    hidden.style.opacity = 0.0;
    doc.add(1, "#spinner", hidden);
    let ctx = context(&doc);
    register(&ctx, "spinner", "#spinner");

    let mut payload = wait(WaitMode::Visible);
    payload.element_name = Some("spinner".into());
    let instr = Instruction::new("w1", InstructionKind::Wait(payload)).with_timeout(1.0);
    let result = catalog::execute(&instr, &ctx).await;

    assert!(!result.success);
}

#[tokio::test(start_paused = true)]
async fn test_get_text_stores_and_returns_value() {
    let doc = FakeDocument::new();
    let mut title = FakeNode::new("h1", Rect::new(0.0, 0.0, 300.0, 40.0));
    title.text = "Welcome".into();
    title.html = "<h1>Welcome</h1>".into();
    doc.add(1, "h1", title);
    let ctx = context(&doc);
    register(&ctx, "title", "h1");

    let instr = Instruction::new(
        "g1",
        InstructionKind::GetText(GetTextPayload {
            element_name: "title".into(),
            text_type: TextType::InnerText,
            include_html: false,
        }),
    );
    let result = catalog::execute(&instr, &ctx).await;
    assert!(result.success);
    assert_eq!(result.data.unwrap()["text"], "Welcome");
    assert_eq!(
        ctx.registry.get("title").unwrap().extracted_text.as_deref(),
        Some("Welcome")
    );

    let html = Instruction::new(
        "g2",
        InstructionKind::GetText(GetTextPayload {
            element_name: "title".into(),
            text_type: TextType::InnerText,
            include_html: true,
        }),
    );
    let result = catalog::execute(&html, &ctx).await;
    assert_eq!(result.data.unwrap()["text"], "<h1>Welcome</h1>");
}

#[tokio::test(start_paused = true)]
async fn test_locate_upserts_descriptor_with_live_handle() {
    let doc = FakeDocument::new();
    let node = doc.add(4, "unused", FakeNode::new("a", Rect::new(0.0, 0.0, 10.0, 10.0)));
    doc.with_state(|s| {
        s.xpath.insert("//a[@id='next']".into(), node);
    });
    let ctx = context(&doc);

    let instr = Instruction::new(
        "l1",
        InstructionKind::Locate(LocatePayload {
            element: ElementDescriptor::new("next", "//a[@id='next']", SelectorType::Xpath),
        }),
    );
    let result = catalog::execute(&instr, &ctx).await;

    assert!(result.success);
    let stored = ctx.registry.get("next").unwrap();
    assert_eq!(stored.cached_handle(), Some(node));
}

#[tokio::test(start_paused = true)]
async fn test_locate_miss_leaves_registry_untouched() {
    let doc = FakeDocument::new();
    let ctx = context(&doc);

    let instr = Instruction::new(
        "l1",
        InstructionKind::Locate(LocatePayload {
            element: ElementDescriptor::css("nope", "#nope"),
        }),
    );
    let result = catalog::execute(&instr, &ctx).await;

    assert!(!result.success);
    assert!(ctx.registry.get("nope").is_none());
}
