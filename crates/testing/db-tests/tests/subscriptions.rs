use concepts::{
    Endpoint, RecipientId,
    storage::{DbPool, DbPoolCloseable},
};
use db_tests::{Database, at, subscription};
use rstest::rstest;
use test_utils::set_up;

fn endpoints(subscriptions: &[concepts::Subscription]) -> Vec<&str> {
    let mut endpoints: Vec<_> = subscriptions.iter().map(|s| s.endpoint.as_str()).collect();
    endpoints.sort_unstable();
    endpoints
}

#[rstest]
#[tokio::test]
async fn upsert_and_list(#[values(Database::Memory, Database::Sqlite)] database: Database) {
    set_up();
    let (_guard, db_pool) = database.set_up().await;
    let store = db_pool.subscriptions();
    store.upsert(subscription("u1", "https://push/a", 0)).await.unwrap();
    store.upsert(subscription("u1", "https://push/b", 1)).await.unwrap();
    store.upsert(subscription("u2", "https://push/c", 2)).await.unwrap();

    let u1 = store
        .list_by_recipient(&RecipientId::new_unchecked("u1"))
        .await
        .unwrap();
    assert_eq!(vec!["https://push/a", "https://push/b"], endpoints(&u1));
    let a = u1
        .iter()
        .find(|s| s.endpoint.as_str() == "https://push/a")
        .unwrap();
    assert_eq!("auth-https://push/a", a.auth_secret);
    assert_eq!("key-https://push/a", a.encryption_key);
    assert_eq!(at(0), a.created_at);

    let unknown = store
        .list_by_recipient(&RecipientId::new_unchecked("nobody"))
        .await
        .unwrap();
    assert!(unknown.is_empty());

    let many = store
        .list_by_recipients(&[
            RecipientId::new_unchecked("u2"),
            RecipientId::new_unchecked("u1"),
            RecipientId::new_unchecked("u2"),
        ])
        .await
        .unwrap();
    assert_eq!(
        vec!["https://push/a", "https://push/b", "https://push/c"],
        endpoints(&many)
    );
    assert_eq!(3, store.list_all().await.unwrap().len());
    db_pool.close().await;
}

#[rstest]
#[tokio::test]
async fn refresh_keeps_single_row(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let (_guard, db_pool) = database.set_up().await;
    let store = db_pool.subscriptions();
    store.upsert(subscription("u1", "https://push/a", 0)).await.unwrap();
    let mut refreshed = subscription("u1", "https://push/a", 100);
    refreshed.auth_secret = "rotated".to_string();
    store.upsert(refreshed).await.unwrap();

    let all = store.list_all().await.unwrap();
    assert_eq!(1, all.len());
    assert_eq!("rotated", all[0].auth_secret);
    assert_eq!(at(0), all[0].created_at);
    db_pool.close().await;
}

#[rstest]
#[tokio::test]
async fn endpoint_moves_to_new_owner(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let (_guard, db_pool) = database.set_up().await;
    let store = db_pool.subscriptions();
    store.upsert(subscription("u1", "https://push/shared", 0)).await.unwrap();
    store.upsert(subscription("u2", "https://push/shared", 1)).await.unwrap();

    let u1 = store
        .list_by_recipient(&RecipientId::new_unchecked("u1"))
        .await
        .unwrap();
    assert!(u1.is_empty());
    let all = store.list_all().await.unwrap();
    assert_eq!(1, all.len());
    assert_eq!("u2", all[0].recipient_id.as_str());
    db_pool.close().await;
}

#[rstest]
#[tokio::test]
async fn remove_reports_whether_a_row_existed(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let (_guard, db_pool) = database.set_up().await;
    let store = db_pool.subscriptions();
    store.upsert(subscription("u1", "https://push/a", 0)).await.unwrap();
    let recipient_id = RecipientId::new_unchecked("u1");
    let endpoint = Endpoint::new_unchecked("https://push/a");

    assert!(
        !store
            .remove(&RecipientId::new_unchecked("u2"), &endpoint)
            .await
            .unwrap(),
        "endpoint is owned by u1"
    );
    assert!(store.remove(&recipient_id, &endpoint).await.unwrap());
    assert!(!store.remove(&recipient_id, &endpoint).await.unwrap());
    assert!(store.list_all().await.unwrap().is_empty());
    db_pool.close().await;
}
