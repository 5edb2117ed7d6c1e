mod common;

use tool_tracker::{
    db, lending, qr,
    structs::{ToolState, ACTION_LEND, ACTION_RETURN},
    AppError, AppState,
};

async fn assert_invariant(state: &AppState) {
    for tool in db::list_tools(state).await.unwrap() {
        let open = db::open_transaction_for_tool(state, tool.id).await.unwrap();
        assert_eq!(
            tool.rented_by.is_some(),
            open.is_some(),
            "rented_by and ledger disagree for {}",
            tool.name
        );
        let open_count = db::transactions_for_tool(state, tool.id)
            .await
            .unwrap()
            .iter()
            .filter(|t| t.is_open())
            .count();
        assert!(open_count <= 1);
    }
}

#[tokio::test]
async fn hammer_goes_out_and_comes_back() {
    let state = common::memory_state().await;
    let hammer = db::add_tool(&state, "Hammer", "Drawer 1").await.unwrap();
    let alice = db::add_user(&state, "alice", "password1", false).await.unwrap();
    assert_eq!(hammer.id, 1);
    assert_eq!(hammer.state(), ToolState::Available);

    lending::lend_tool(&state, hammer.id, alice.id).await.unwrap();
    let lent = db::get_tool(&state, hammer.id).await.unwrap();
    assert_eq!(lent.state(), ToolState::Lent("alice".to_owned()));

    lending::return_tool(&state, hammer.id, alice.id).await.unwrap();
    let back = db::get_tool(&state, hammer.id).await.unwrap();
    assert_eq!(back.state(), ToolState::Available);

    // list_logs is newest first
    let actions: Vec<String> = db::list_logs(&state)
        .await
        .unwrap()
        .into_iter()
        .rev()
        .map(|l| l.action)
        .collect();
    assert_eq!(actions, vec![ACTION_LEND.to_owned(), ACTION_RETURN.to_owned()]);
    assert_invariant(&state).await;
}

#[tokio::test]
async fn scanned_payload_drives_lend_and_return() {
    let state = common::memory_state().await;
    let drill = db::add_tool(&state, "Drill", "Under Desk 1").await.unwrap();
    let bob = db::add_user(&state, "bob", "password2", false).await.unwrap();
    let payload = drill.qr_code.clone().unwrap();

    let resolved = qr::resolve_tool(&state, &payload).await.unwrap().unwrap();
    assert_eq!(resolved.id, drill.id);
    lending::lend_tool(&state, resolved.id, bob.id).await.unwrap();

    // a forged token still resolves: only the id is trusted
    let forged = format!("{}:Drill:AAAAAAAAAA", drill.id);
    let again = qr::resolve_tool(&state, &forged).await.unwrap().unwrap();
    let receipt = lending::return_tool(&state, again.id, bob.id).await.unwrap();
    assert_eq!(receipt.tool_name, "Drill");

    assert!(qr::resolve_tool(&state, "999:Ghost:xxxxxxxxxx").await.unwrap().is_none());
    assert!(qr::resolve_tool(&state, "not a code:at all").await.unwrap().is_none());
    assert_eq!(
        qr::resolve_tool(&state, "Drill").await.unwrap().map(|t| t.id),
        Some(drill.id)
    );
}

#[tokio::test]
async fn rejected_calls_have_no_side_effects() {
    let state = common::memory_state().await;
    db::seed_test_data(&state).await.unwrap();
    let hammer = db::get_tool_by_name(&state, "Hammer").await.unwrap().unwrap();
    let wrench = db::get_tool_by_name(&state, "Wrench").await.unwrap().unwrap();
    let charlie = db::get_user_by_username(&state, "Charlie").await.unwrap().unwrap();

    let logs_before = db::list_logs(&state).await.unwrap();
    let loans_before = db::open_loans(&state).await.unwrap().len();

    assert!(matches!(
        lending::lend_tool(&state, hammer.id, charlie.id).await,
        Err(AppError::AlreadyLent)
    ));
    assert!(matches!(
        lending::return_tool(&state, wrench.id, charlie.id).await,
        Err(AppError::NoActiveLoan)
    ));

    assert_eq!(db::list_logs(&state).await.unwrap(), logs_before);
    assert_eq!(db::open_loans(&state).await.unwrap().len(), loans_before);
    assert_eq!(
        db::get_tool(&state, hammer.id).await.unwrap().rented_by.as_deref(),
        Some("Alice")
    );
    assert_invariant(&state).await;
}

#[tokio::test]
async fn invariant_holds_through_a_busy_day() {
    let state = common::memory_state().await;
    db::seed_test_data(&state).await.unwrap();
    let tools = db::list_tools(&state).await.unwrap();
    let users = db::list_users(&state).await.unwrap();

    for round in 0..3 {
        for (i, tool) in tools.iter().enumerate() {
            let user = &users[(i + round) % users.len()];
            let _ = lending::lend_tool(&state, tool.id, user.id).await;
            assert_invariant(&state).await;
            if (i + round) % 2 == 0 {
                let _ = lending::return_tool(&state, tool.id, user.id).await;
                assert_invariant(&state).await;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lends_of_one_tool_admit_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let state = common::file_state(dir.path()).await;
    let tool_id = db::add_tool(&state, "Hammer", "Drawer 1").await.unwrap().id;

    let mut user_ids = Vec::new();
    for name in ["alice", "bob", "carol", "dave", "erin"] {
        user_ids.push(db::add_user(&state, name, "pw", false).await.unwrap().id);
    }

    let handles: Vec<_> = user_ids
        .into_iter()
        .map(|user_id| {
            let state = state.clone();
            tokio::spawn(async move { lending::lend_tool(&state, tool_id, user_id).await })
        })
        .collect();

    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(AppError::AlreadyLent) => rejections += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(rejections, 4);

    let open: Vec<_> = db::transactions_for_tool(&state, tool_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.is_open())
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(db::list_logs(&state).await.unwrap().len(), 1);
    assert_invariant(&state).await;
}

#[tokio::test]
async fn open_transaction_index_rejects_a_second_open_row() {
    let state = common::memory_state().await;
    let tool = db::add_tool(&state, "Saw", "Drawer 4").await.unwrap();
    let alice = db::add_user(&state, "alice", "pw", false).await.unwrap();
    lending::lend_tool(&state, tool.id, alice.id).await.unwrap();

    let res = sqlx::query(
        "INSERT INTO transactions (user_id, tool_id, borrow_date) VALUES ($1, $2, $3)",
    )
    .bind(alice.id)
    .bind(tool.id)
    .bind(chrono::Utc::now())
    .execute(&state.db_pool)
    .await;
    assert!(res.is_err());
}
