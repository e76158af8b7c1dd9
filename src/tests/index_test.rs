use serde_json::Value;

use crate::index::IndexDefinition;
use crate::storage_error::StorageError;
use crate::test_driver;
use crate::tests::fixtures::*;

#[tokio::test]
async fn index_projects_membership_pairs() {
    let store = conference_fixture().await;

    let mut session = store.open_session();
    let all: Vec<MembershipProjection> = session
        .query::<MembershipByEventAndUserId>()
        .to_list()
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|m| m.event_id == "Event/Raven-Rocks"));
}

#[tokio::test]
async fn where_equals_filters_on_projected_field() {
    let store = conference_fixture().await;

    let mut session = store.open_session();
    let simi: Vec<MembershipProjection> = session
        .query::<MembershipByEventAndUserId>()
        .where_equals("UserId", "User/Simi")
        .to_list()
        .await
        .unwrap();
    assert_eq!(simi.len(), 1);
    assert_eq!(simi[0].user_id, "User/Simi");

    let nobody: Vec<MembershipProjection> = session
        .query::<MembershipByEventAndUserId>()
        .where_equals("UserId", "User/Nobody")
        .to_list()
        .await
        .unwrap();
    assert!(nobody.is_empty());
}

#[tokio::test]
async fn index_follows_document_updates() {
    let store = conference_fixture().await;

    // Move membership 1 over to Simi.
    let mut session = store.open_session();
    session
        .store_entity(&Membership::new(
            "Membership/1",
            "User/Simi",
            "Event/Raven-Rocks",
        ))
        .unwrap();
    session.save_changes().await.unwrap();
    test_driver::wait_for_indexing(&store).await.unwrap();

    let mut reader = store.open_session();
    let ayende: Vec<MembershipProjection> = reader
        .query::<MembershipByEventAndUserId>()
        .where_equals("UserId", "User/Ayende")
        .to_list()
        .await
        .unwrap();
    assert!(ayende.is_empty());

    let simi: Vec<MembershipProjection> = reader
        .query::<MembershipByEventAndUserId>()
        .where_equals("UserId", "User/Simi")
        .to_list()
        .await
        .unwrap();
    assert_eq!(simi.len(), 2);
}

#[tokio::test]
async fn index_drops_deleted_documents() {
    let store = conference_fixture().await;

    let mut session = store.open_session();
    session.delete("Membership/1");
    session.save_changes().await.unwrap();
    test_driver::wait_for_indexing(&store).await.unwrap();

    let mut reader = store.open_session();
    let all: Vec<MembershipProjection> = reader
        .query::<MembershipByEventAndUserId>()
        .to_list()
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].user_id, "User/Simi");
}

#[tokio::test]
async fn index_built_over_preexisting_documents() {
    // conference_fixture registers the index after the commit, so the rebuild
    // path is what populated it; verify a re-registration also settles.
    let store = conference_fixture().await;
    store
        .execute_index::<MembershipByEventAndUserId>()
        .await
        .unwrap();
    test_driver::wait_for_indexing(&store).await.unwrap();

    let mut session = store.open_session();
    let all: Vec<MembershipProjection> = session
        .query::<MembershipByEventAndUserId>()
        .to_list()
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn index_ignores_other_collections() {
    let store = conference_fixture().await;

    // Users and events were stored alongside memberships; none of them may
    // leak into the membership index.
    let entries = store
        .query_index("Membership/ByEventAndUserId", None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.get("UserId").is_some()));
}

#[tokio::test]
async fn wait_for_indexing_times_out_while_rebuild_runs() {
    struct SlowMembership;
    impl IndexDefinition for SlowMembership {
        const NAME: &'static str = "Membership/Slow";
        const COLLECTION: &'static str = "Membership";

        fn map(doc: &Value) -> Option<Value> {
            // Keep the rebuild busy long enough for the deadline to pass.
            std::thread::sleep(std::time::Duration::from_millis(200));
            Some(serde_json::json!({ "UserId": doc.get("UserId")? }))
        }
    }

    let store = conference_fixture().await;
    store.execute_index::<SlowMembership>().await.unwrap();

    let err = store
        .wait_for_indexing(std::time::Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::IndexingTimeout));

    // The rebuild itself still finishes once given time.
    test_driver::wait_for_indexing(&store).await.unwrap();
    let entries = store.query_index(SlowMembership::NAME, None).await.unwrap();
    assert_eq!(entries.len(), 2);
}

struct UnregisteredIndex;

impl IndexDefinition for UnregisteredIndex {
    const NAME: &'static str = "Users/Unregistered";
    const COLLECTION: &'static str = "User";

    fn map(_doc: &Value) -> Option<Value> {
        None
    }
}

#[tokio::test]
async fn querying_unknown_index_fails() {
    let store = conference_fixture().await;

    let mut session = store.open_session();
    let err = session
        .query::<UnregisteredIndex>()
        .to_list::<Value>()
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::IndexNotFound(_)));
}

#[tokio::test]
async fn map_returning_none_skips_document() {
    struct AyendeOnly;
    impl IndexDefinition for AyendeOnly {
        const NAME: &'static str = "Membership/AyendeOnly";
        const COLLECTION: &'static str = "Membership";

        fn map(doc: &Value) -> Option<Value> {
            let user_id = doc.get("UserId")?.as_str()?;
            if user_id != "User/Ayende" {
                return None;
            }
            Some(serde_json::json!({ "UserId": user_id }))
        }
    }

    let store = conference_fixture().await;
    store.execute_index::<AyendeOnly>().await.unwrap();
    test_driver::wait_for_indexing(&store).await.unwrap();

    let entries = store.query_index(AyendeOnly::NAME, None).await.unwrap();
    assert_eq!(entries.len(), 1);
}
