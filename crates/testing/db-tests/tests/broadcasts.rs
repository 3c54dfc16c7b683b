use concepts::{
    BroadcastId, BroadcastMessage, RecipientId, RecipientSelector,
    storage::{DbPool, DbPoolCloseable},
};
use db_tests::{Database, at};
use rstest::rstest;
use test_utils::set_up;

fn message(idx: u64, recipient_selector: RecipientSelector) -> BroadcastMessage {
    BroadcastMessage {
        id: BroadcastId::from_parts(1_700_000_000_000 + idx, u128::from(idx)),
        text: format!("message {idx}"),
        recipient_selector,
        sent_count: 2,
        failed_count: 1,
        total_targeted: 3,
        issued_by: "admin".to_string(),
        issued_at: at(i64::try_from(idx).unwrap()),
    }
}

#[rstest]
#[tokio::test]
async fn append_keeps_newest_entries(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let (_guard, db_pool) = database.set_up().await;
    let store = db_pool.broadcasts();
    for idx in 0..5 {
        store
            .append(message(idx, RecipientSelector::All), 3)
            .await
            .unwrap();
    }

    let all = store.list(10).await.unwrap();
    let texts: Vec<_> = all.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(vec!["message 4", "message 3", "message 2"], texts);
    assert_eq!(1, store.list(1).await.unwrap().len());
    db_pool.close().await;
}

#[rstest]
#[tokio::test]
async fn message_fields_survive_storage(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let (_guard, db_pool) = database.set_up().await;
    let store = db_pool.broadcasts();
    let expected = message(
        7,
        RecipientSelector::Explicit(vec![
            RecipientId::new_unchecked("u1"),
            RecipientId::new_unchecked("u2"),
        ]),
    );
    store.append(expected.clone(), 100).await.unwrap();

    assert_eq!(vec![expected], store.list(10).await.unwrap());
    db_pool.close().await;
}
