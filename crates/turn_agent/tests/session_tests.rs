mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{empty, interrupted, ok, ScriptedBackend, Step, WholeReplyBackend};
use dialog_core::{DialogTree, JsonFileTreeStorage, Role, SessionConfig, TreeStorage, Usage};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use turn_agent::{ChatSession, TurnError, TurnEvent, TurnOutcome};

fn session_config(retry_count: u32) -> SessionConfig {
    SessionConfig {
        system_prompt: Some("You are terse.".to_string()),
        retry_count,
        ..Default::default()
    }
}

fn session(backend: Arc<ScriptedBackend>, retry_count: u32) -> ChatSession {
    ChatSession::new("s1", DialogTree::new(), session_config(retry_count), backend)
}

#[tokio::test]
async fn submitted_message_gets_an_accepted_answer() {
    let backend = Arc::new(ScriptedBackend::new("gpt", vec![ok("hi there", 5, 3)]));
    let session = session(backend.clone(), 3);

    let report = session.submit_user_message("hello").await.unwrap();

    assert_eq!(report.content, "hi there");
    let tree = session.tree();
    let tree = tree.read().await;
    assert_eq!(tree.active_leaf(), report.node_id);
    let set = tree.response_set(report.node_id).unwrap();
    let item = set.accepted_item().unwrap();
    assert_eq!(item.id, report.item_id);
    assert!(!item.responding);
    assert_eq!(item.tokens, 3);
    assert_eq!(item.usage.total_tokens, 8);
    assert_eq!(backend.seen_prompts(), vec![Some("You are terse.".to_string())]);
    drop(tree);

    let context = session.materialize_active().await.unwrap();
    let roles: Vec<Role> = context.history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
}

#[tokio::test]
async fn follow_up_messages_extend_the_active_path() {
    let backend = Arc::new(ScriptedBackend::new(
        "gpt",
        vec![ok("one", 1, 1), ok("two", 1, 1)],
    ));
    let session = session(backend, 3);

    let first = session.submit_user_message("a").await.unwrap();
    let second = session.submit_user_message("b").await.unwrap();

    let tree = session.tree();
    let tree = tree.read().await;
    let path = tree.path_to(second.node_id).unwrap();
    assert!(path.contains(&first.node_id));
    assert_eq!(path.len(), 5);
}

#[tokio::test]
async fn exhausted_turn_keeps_failed_item_out_of_context() {
    let backend = Arc::new(ScriptedBackend::new(
        "gpt",
        vec![empty(2, 0), interrupted("par", 3, 1)],
    ));
    let session = session(backend, 2);

    let error = assert_err!(session.submit_user_message("hello").await);
    assert!(matches!(error, TurnError::Exhausted { attempts: 2, .. }));

    let tree = session.tree();
    let tree = tree.read().await;
    let node_id = tree.active_leaf();
    let node = tree.get(node_id).unwrap();
    assert!(!node.is_available_in_context());
    let item = &tree.response_set(node_id).unwrap().items()[0];
    assert!(!item.responding);
    assert!(item
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("stream interrupted")));
    assert_eq!(item.usage.total_tokens, 6);
}

#[tokio::test]
async fn partial_text_of_a_failed_turn_never_reaches_the_next_call() {
    let backend = Arc::new(WholeReplyBackend::new(
        "gpt",
        TurnOutcome::interrupted("partial garb", Usage::new(1, 1, 0.0), "reset"),
    ));
    let session = ChatSession::new("s1", DialogTree::new(), session_config(2), backend.clone());

    let error = assert_err!(session.submit_user_message("hello").await);
    assert!(matches!(error, TurnError::Exhausted { attempts: 2, .. }));
    assert_eq!(backend.calls(), 2);

    let tree = session.tree();
    let tree = tree.read().await;
    let node_id = tree.active_leaf();
    let item = &tree.response_set(node_id).unwrap().items()[0];
    assert_eq!(item.content, "partial garb");
    assert!(item.error_message.is_some());
    assert!(!tree.get(node_id).unwrap().is_available_in_context());
    drop(tree);

    let context = session.materialize_active().await.unwrap();
    let contents: Vec<&str> = context.history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hello"]);
}

#[tokio::test]
async fn cancelled_submission_leaves_no_empty_response_set() {
    let backend = Arc::new(ScriptedBackend::new("gpt", vec![Step::Hang]));
    let mut started = backend.watch();
    let session = session(backend, 3);

    let (result, ()) = tokio::join!(session.submit_user_message("hello"), async {
        started.recv().await;
        let items = session.in_flight_items();
        assert_eq!(items.len(), 1);
        assert!(session.cancel_item(items[0]));
    });

    assert!(assert_err!(result).is_cancelled());
    let tree = session.tree();
    let tree = tree.read().await;
    let user = tree.active_leaf();
    assert_eq!(tree.get(user).unwrap().role(), Role::User);
    assert!(tree.children(user).unwrap().is_empty());
    assert!(session.in_flight_items().is_empty());
}

#[tokio::test]
async fn regenerate_adds_and_accepts_a_new_alternative() {
    let backend = Arc::new(ScriptedBackend::new(
        "gpt",
        vec![ok("first", 1, 1), ok("second", 1, 1)],
    ));
    let session = session(backend, 3);
    let report = session.submit_user_message("hello").await.unwrap();

    let again = session.regenerate(report.node_id).await.unwrap();

    assert_eq!(again.node_id, report.node_id);
    let tree = session.tree();
    let tree = tree.read().await;
    let set = tree.response_set(report.node_id).unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(set.explicit_accepted(), Some(1));
    assert_eq!(tree.get(report.node_id).unwrap().content(), Some("second"));
}

#[tokio::test]
async fn accept_switches_materialized_content() {
    let backend = Arc::new(ScriptedBackend::new(
        "gpt",
        vec![ok("first", 1, 1), ok("second", 1, 1)],
    ));
    let session = session(backend, 3);
    let report = session.submit_user_message("hello").await.unwrap();
    session.regenerate(report.node_id).await.unwrap();

    assert_ok!(session.accept(report.node_id, 0).await);

    let context = session.materialize_active().await.unwrap();
    assert_eq!(context.history.last().unwrap().content, "first");
    assert!(matches!(
        session.accept(report.node_id, 9).await,
        Err(TurnError::Tree(_))
    ));
}

#[tokio::test]
async fn parallel_regenerations_cancel_independently() {
    let primary = Arc::new(ScriptedBackend::new("gpt", vec![ok("base", 1, 1)]));
    let fast = Arc::new(ScriptedBackend::new("fast", vec![ok("quick", 1, 1)]));
    let slow = Arc::new(ScriptedBackend::new("slow", vec![Step::Hang]));
    let mut slow_started = slow.watch();
    let session = session(primary, 3);
    session.register_backend(fast.clone());
    session.register_backend(slow.clone());
    let report = session.submit_user_message("hello").await.unwrap();

    let (results, ()) = tokio::join!(
        session.regenerate_parallel(report.node_id, &["fast", "slow"]),
        async {
            slow_started.recv().await;
            let slow_item = {
                let tree = session.tree();
                let tree = tree.read().await;
                tree.response_set(report.node_id)
                    .unwrap()
                    .items()
                    .iter()
                    .find(|item| item.backend == "slow")
                    .map(|item| item.id)
                    .unwrap()
            };
            assert!(session.cancel_item(slow_item));
        }
    );

    let results = results.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap().content, "quick");
    assert!(matches!(results[1], Err(TurnError::Cancelled { .. })));

    let tree = session.tree();
    let tree = tree.read().await;
    let set = tree.response_set(report.node_id).unwrap();
    let backends: Vec<&str> = set.items().iter().map(|i| i.backend.as_str()).collect();
    assert_eq!(backends, vec!["gpt", "fast"]);
    assert!(!set.is_responding());
}

#[tokio::test]
async fn retry_item_reuses_the_items_backend() {
    let primary = Arc::new(ScriptedBackend::new("gpt", vec![ok("base", 1, 1)]));
    let other = Arc::new(ScriptedBackend::new(
        "claude",
        vec![ok("alt", 1, 1), ok("alt again", 1, 1)],
    ));
    let session = session(primary, 3);
    session.register_backend(other.clone());
    let report = session.submit_user_message("hello").await.unwrap();
    let alt = session
        .regenerate_parallel(report.node_id, &["claude"])
        .await
        .unwrap()
        .pop()
        .unwrap()
        .unwrap();

    let retried = session.retry_item(report.node_id, alt.item_id).await.unwrap();

    assert_eq!(retried.content, "alt again");
    assert_eq!(other.calls(), 2);
    let tree = session.tree();
    let tree = tree.read().await;
    let set = tree.response_set(report.node_id).unwrap();
    assert_eq!(set.item(retried.item_id).unwrap().backend, "claude");
}

#[tokio::test]
async fn unknown_backend_is_rejected_before_touching_the_tree() {
    let backend = Arc::new(ScriptedBackend::new("gpt", vec![ok("base", 1, 1)]));
    let session = session(backend, 3);
    let report = session.submit_user_message("hello").await.unwrap();

    let error = assert_err!(
        session
            .regenerate_parallel(report.node_id, &["missing"])
            .await
    );

    assert!(matches!(error, TurnError::UnknownBackend(name) if name == "missing"));
    let tree = session.tree();
    assert_eq!(tree.read().await.response_set(report.node_id).unwrap().len(), 1);
}

#[tokio::test]
async fn streamed_text_from_a_lost_attempt_is_discarded() {
    let backend = Arc::new(ScriptedBackend::new(
        "gpt",
        vec![
            Step::Stream(
                vec!["garb", "age"],
                TurnOutcome::interrupted("garbage", Usage::default(), "reset"),
            ),
            Step::Stream(
                vec!["clean"],
                TurnOutcome::completed("clean", Usage::default()),
            ),
        ],
    ));
    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    let session = session(backend, 3).with_observer(observer_tx);

    let report = session.submit_user_message("hello").await.unwrap();

    assert_eq!(report.content, "clean");
    assert_eq!(report.attempts, 2);
    {
        let tree = session.tree();
        let tree = tree.read().await;
        let item = tree.response_set(report.node_id).unwrap().items()[0].clone();
        assert_eq!(item.content, "clean");
    }
    let mut deltas = Vec::new();
    while let Ok(tagged) = observer_rx.try_recv() {
        assert_eq!(tagged.item_id, report.item_id);
        if let TurnEvent::Delta { attempt, content } = tagged.event {
            deltas.push((attempt, content));
        }
    }
    assert_eq!(
        deltas,
        vec![
            (1, "garb".to_string()),
            (1, "age".to_string()),
            (2, "clean".to_string())
        ]
    );
}

#[tokio::test]
async fn session_round_trips_through_storage() {
    let dir = tempfile::tempdir().unwrap();
    let storage = JsonFileTreeStorage::new(dir.path());
    let backend = Arc::new(ScriptedBackend::new("gpt", vec![ok("saved", 2, 2)]));
    let session = session(backend.clone(), 3);
    let report = session.submit_user_message("hello").await.unwrap();

    session.save(&storage).await.unwrap();
    assert!(storage.tree_exists("s1").await);
    let restored = ChatSession::load("s1", &storage, session_config(3), backend)
        .await
        .unwrap();

    let context = restored.materialize_active().await.unwrap();
    assert_eq!(context.leaf_id, report.node_id);
    assert_eq!(context.history.last().unwrap().content, "saved");
}

async fn delete_pending_reply(session: &ChatSession) {
    session
        .with_tree(|tree| {
            let user = tree.active_leaf();
            let reply = tree.children(user).unwrap()[0];
            tree.delete_subtree(reply).unwrap();
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn reply_deleted_mid_turn_still_reports_its_content() {
    let backend = Arc::new(ScriptedBackend::new(
        "gpt",
        vec![Step::Delay(
            Duration::from_secs(2),
            TurnOutcome::completed("late", Usage::new(3, 2, 0.0)),
        )],
    ));
    let mut started = backend.watch();
    let session = session(backend, 3);

    let (result, ()) = tokio::join!(session.submit_user_message("hello"), async {
        started.recv().await;
        delete_pending_reply(&session).await;
    });

    let report = assert_ok!(result);
    assert_eq!(report.content, "late");
    assert_eq!(report.usage.total_tokens, 5);
    let tree = session.tree();
    let tree = tree.read().await;
    assert!(!tree.contains(report.node_id));
    assert_eq!(tree.get(tree.active_leaf()).unwrap().role(), Role::User);
}

#[tokio::test]
async fn reply_deleted_before_cancel_still_reports_cancellation() {
    let backend = Arc::new(ScriptedBackend::new("gpt", vec![Step::Hang]));
    let mut started = backend.watch();
    let session = session(backend, 3);

    let (result, ()) = tokio::join!(session.submit_user_message("hello"), async {
        started.recv().await;
        delete_pending_reply(&session).await;
        let items = session.in_flight_items();
        assert!(session.cancel_item(items[0]));
    });

    assert!(assert_err!(result).is_cancelled());
    assert!(session.in_flight_items().is_empty());
}
