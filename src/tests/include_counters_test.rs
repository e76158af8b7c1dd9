use serde::Deserialize;

use crate::storage_error::StorageError;
use crate::tests::fixtures::*;

// The two scenarios from the original harness: a query include on a related
// document must make both the document and its counters available to the
// session without further round trips.

#[tokio::test]
async fn include_makes_related_document_counters_available() {
    let store = conference_fixture().await;

    let mut session = store.open_session();
    session.set_max_requests_per_session(1);

    let memberships: Vec<MembershipProjection> = session
        .query::<MembershipByEventAndUserId>()
        .where_equals("UserId", "User/Ayende")
        .include("EventId")
        .to_list()
        .await
        .unwrap();

    let event: Option<Event> = session.load("Event/Raven-Rocks").await.unwrap();
    let number_of_members = session
        .counters_for("Event/Raven-Rocks")
        .get("Members")
        .await
        .unwrap();

    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0].event_id, "Event/Raven-Rocks");
    assert!(event.is_some());
    assert_eq!(number_of_members, Some(2));
    assert_eq!(session.requests_made(), 1);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CustomResult {
    user_id: String,
    members: i64,
}

#[tokio::test]
async fn projection_function_reads_included_counters() {
    let store = conference_fixture().await;

    let mut session = store.open_session();
    session.set_max_requests_per_session(1);

    let result = session
        .raw_query::<CustomResult>(
            r#"
            declare function includeRelatedCounters(d) {
                include(d.EventId);
                var numberOfMembers = counter(d.EventId, "Members");
                return { UserId: d.UserId, Members: numberOfMembers }
            }

            from index "Membership/ByEventAndUserId" as d
            where UserId = "User/Ayende"
            select includeRelatedCounters(d)
            include timings()
            "#,
        )
        .await
        .unwrap();

    assert!(result.timings.is_some());
    let first = result.into_first().expect("one projected result");
    assert_eq!(first.user_id, "User/Ayende");
    assert_eq!(first.members, 2);

    let event: Option<Event> = session.load("Event/Raven-Rocks").await.unwrap();
    assert!(event.is_some());
    assert_eq!(session.requests_made(), 1);
}

#[tokio::test]
async fn counter_read_without_include_costs_a_request() {
    let store = conference_fixture().await;

    let mut session = store.open_session();
    session.set_max_requests_per_session(1);

    let memberships: Vec<MembershipProjection> = session
        .query::<MembershipByEventAndUserId>()
        .where_equals("UserId", "User/Ayende")
        .to_list()
        .await
        .unwrap();
    assert_eq!(memberships.len(), 1);

    // No include, so the counter read needs its own round trip and the
    // budget of 1 is already spent.
    let err = session
        .counters_for("Event/Raven-Rocks")
        .get("Members")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::TooManyRequests { max: 1 }));
}
