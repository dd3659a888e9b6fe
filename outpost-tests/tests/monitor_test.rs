use outpost_sync::ConnectionEvent;
use outpost_test_utils::TestEngine;
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test]
async fn test_transitions_fire_once() {
    let t = TestEngine::new();
    let mut events = t.engine.subscribe();

    // Starts unavailable, so the first good probe is a transition
    assert!(t.engine.is_available().await);
    assert!(t.engine.is_available().await);
    assert_eq!(events.try_recv(), Ok(ConnectionEvent::Restored));
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    t.go_offline();
    assert!(!t.engine.is_available().await);
    assert!(!t.engine.is_available().await);
    assert!(!t.engine.current_connection_status());
    assert_eq!(events.try_recv(), Ok(ConnectionEvent::Lost));
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    t.go_online();
    assert!(t.engine.is_available().await);
    assert_eq!(events.try_recv(), Ok(ConnectionEvent::Restored));
}

#[tokio::test]
async fn test_every_observer_sees_transitions() {
    let t = TestEngine::new();
    let mut first = t.engine.subscribe();
    let mut second = t.engine.subscribe();

    t.go_offline();
    assert!(!t.engine.is_available().await);
    // Unavailable to unavailable is not a transition
    assert_eq!(first.try_recv(), Err(TryRecvError::Empty));

    t.go_online();
    assert!(t.engine.is_available().await);
    assert_eq!(first.try_recv(), Ok(ConnectionEvent::Restored));
    assert_eq!(second.try_recv(), Ok(ConnectionEvent::Restored));
}
