mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use browser_pilot::error::InteractionError;
use browser_pilot::hands::{InteractionLayer, LocatorAction, Point, Resolution};
use browser_pilot::types::{AccessibilityNode, ActionKind, TargetDescriptor};
use common::{Call, FakeDriver, fast_interaction};

fn button(id: &str, backing: i64) -> AccessibilityNode {
    AccessibilityNode {
        id: id.to_string(),
        role: "button".to_string(),
        name: "Submit".to_string(),
        backing_element_id: Some(backing),
        ignored: false,
    }
}

fn layer(driver: &Arc<FakeDriver>) -> InteractionLayer {
    InteractionLayer::new(driver.clone(), fast_interaction())
}

fn target(node_id: Option<&str>, selector: Option<&str>, value: Option<&str>) -> TargetDescriptor {
    TargetDescriptor {
        node_id: node_id.map(str::to_string),
        selector: selector.map(str::to_string),
        value: value.map(str::to_string),
    }
}

#[tokio::test]
async fn node_id_clicks_the_quad_centre_after_gliding_the_pointer() {
    let driver = Arc::new(FakeDriver::started());
    driver
        .quads
        .lock()
        .unwrap()
        .insert(42, vec![10.0, 20.0, 110.0, 20.0, 110.0, 60.0, 10.0, 60.0]);

    let resolution = layer(&driver)
        .execute(
            ActionKind::Click,
            &target(Some("5"), Some("#fallback"), None),
            &[button("5", 42)],
        )
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Protocol);
    let calls = driver.calls();
    assert_eq!(calls[0], Call::ContentQuad(42));
    let moves: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, Call::MovePointer(_)))
        .collect();
    assert_eq!(moves.len(), 10);
    assert_eq!(*moves[9], Call::MovePointer(Point::new(60.0, 40.0)));
    assert_eq!(calls.last(), Some(&Call::ClickAt(Point::new(60.0, 40.0))));
    assert!(!calls.iter().any(|c| matches!(c, Call::Locator(..))));
}

#[tokio::test]
async fn idle_wait_timeout_still_counts_as_success() {
    let driver = Arc::new(FakeDriver::started());
    driver.fail_idle.store(true, Ordering::SeqCst);
    driver
        .quads
        .lock()
        .unwrap()
        .insert(42, vec![10.0, 20.0, 110.0, 20.0, 110.0, 60.0, 10.0, 60.0]);

    let resolution = layer(&driver)
        .execute(ActionKind::Click, &target(Some("5"), None, None), &[button("5", 42)])
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Protocol);
    assert_eq!(driver.calls().last(), Some(&Call::ClickAt(Point::new(60.0, 40.0))));
}

#[tokio::test]
async fn type_by_node_focuses_then_types() {
    let driver = Arc::new(FakeDriver::started());
    driver
        .quads
        .lock()
        .unwrap()
        .insert(7, vec![0.0, 0.0, 20.0, 0.0, 20.0, 10.0, 0.0, 10.0]);

    layer(&driver)
        .execute(
            ActionKind::Type,
            &target(Some("3"), None, Some("rust async")),
            &[button("3", 7)],
        )
        .await
        .unwrap();

    let calls = driver.calls();
    let n = calls.len();
    assert_eq!(calls[n - 2], Call::ClickAt(Point::new(10.0, 5.0)));
    assert_eq!(calls[n - 1], Call::TypeText("rust async".to_string()));
}

#[tokio::test]
async fn unknown_node_falls_back_to_selector() {
    let driver = Arc::new(FakeDriver::started());

    let resolution = layer(&driver)
        .execute(
            ActionKind::Click,
            &target(Some("99"), Some("button.primary"), None),
            &[button("5", 42)],
        )
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Locator);
    assert_eq!(
        driver.calls(),
        vec![
            Call::Highlight("button.primary".to_string()),
            Call::Locator(LocatorAction::Click, "button.primary".to_string(), None),
        ]
    );
}

#[tokio::test]
async fn quad_failure_without_selector_is_a_no_op() {
    let driver = Arc::new(FakeDriver::started());

    let resolution = layer(&driver)
        .execute(ActionKind::Click, &target(Some("5"), None, None), &[button("5", 42)])
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Unresolved);
    assert_eq!(driver.calls(), vec![Call::ContentQuad(42)]);
}

#[tokio::test]
async fn failed_locator_without_primitive_is_reported() {
    let driver = Arc::new(FakeDriver::started());
    driver.fail_locators.store(true, Ordering::SeqCst);

    let err = layer(&driver)
        .execute(ActionKind::Type, &target(None, Some("#q"), Some("hi")), &[])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        InteractionError::Exhausted {
            kind: ActionKind::Type,
            ..
        }
    ));
    assert!(driver.calls().contains(&Call::Locator(
        LocatorAction::Fill,
        "#q".to_string(),
        Some("hi".to_string())
    )));
}

#[tokio::test]
async fn primitives_cover_navigation_keys_and_scrolling() {
    let driver = Arc::new(FakeDriver::started());
    let layer = layer(&driver);

    let resolution = layer
        .execute(ActionKind::Navigate, &target(None, None, Some("example.com")), &[])
        .await
        .unwrap();
    assert_eq!(resolution, Resolution::Primitive);

    layer
        .execute(ActionKind::Press, &target(None, None, Some("Enter")), &[])
        .await
        .unwrap();
    layer
        .execute(ActionKind::Scroll, &target(None, None, None), &[])
        .await
        .unwrap();
    let waited = layer
        .execute(ActionKind::Wait, &target(None, None, None), &[])
        .await
        .unwrap();
    assert_eq!(waited, Resolution::Primitive);

    assert_eq!(
        driver.calls(),
        vec![
            Call::Navigate("https://example.com".to_string()),
            Call::PressKey("Enter".to_string()),
            Call::ScrollBy(0.0, 500.0),
        ]
    );
}

#[tokio::test]
async fn missing_page_is_a_hard_error() {
    let driver = Arc::new(FakeDriver::new());
    let layer = layer(&driver);

    let err = layer
        .execute(ActionKind::Navigate, &target(None, None, Some("example.com")), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, InteractionError::NoActivePage));

    let err = layer
        .execute(ActionKind::Click, &target(None, Some("#go"), None), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, InteractionError::NoActivePage));
}
