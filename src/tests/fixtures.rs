use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::sync::Arc;

use crate::document::Document;
use crate::index::IndexDefinition;
use crate::store::DocumentStore;
use crate::test_driver;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct User {
    pub id: String,
    pub name: String,
}

impl Document for User {
    const COLLECTION: &'static str = "User";
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub id: String,
    pub name: String,
}

impl Document for Event {
    const COLLECTION: &'static str = "Event";
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Membership {
    pub id: String,
    pub user_id: String,
    pub event_id: String,
}

impl Document for Membership {
    const COLLECTION: &'static str = "Membership";
    fn id(&self) -> &str {
        &self.id
    }
}

impl Membership {
    pub fn new(id: &str, user_id: &str, event_id: &str) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            event_id: event_id.into(),
        }
    }
}

pub struct MembershipByEventAndUserId;

impl IndexDefinition for MembershipByEventAndUserId {
    const NAME: &'static str = "Membership/ByEventAndUserId";
    const COLLECTION: &'static str = "Membership";

    fn map(doc: &Value) -> Option<Value> {
        Some(serde_json::json!({
            "UserId": doc.get("UserId")?,
            "EventId": doc.get("EventId")?,
        }))
    }
}

/// Shape of a `MembershipByEventAndUserId` entry.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MembershipProjection {
    pub user_id: String,
    pub event_id: String,
}

/// Two memberships, two users, one event carrying a "Members" counter at 2,
/// with the membership index built and caught up.
pub async fn conference_fixture() -> Arc<DocumentStore> {
    let store = test_driver::ephemeral_store(1_000).await.unwrap();

    let mut session = store.open_session();
    session
        .store_entity(&Membership::new(
            "Membership/1",
            "User/Ayende",
            "Event/Raven-Rocks",
        ))
        .unwrap();
    session
        .store_entity(&Membership::new(
            "Membership/2",
            "User/Simi",
            "Event/Raven-Rocks",
        ))
        .unwrap();
    session
        .store_entity(&User {
            id: "User/Ayende".into(),
            name: "Oren".into(),
        })
        .unwrap();
    session
        .store_entity(&User {
            id: "User/Simi".into(),
            name: "Simon".into(),
        })
        .unwrap();
    session
        .store_entity(&Event {
            id: "Event/Raven-Rocks".into(),
            name: "Raven Rocks developer conference".into(),
        })
        .unwrap();
    session.counters_for("Event/Raven-Rocks").increment("Members", 2);
    session.save_changes().await.unwrap();

    store
        .execute_index::<MembershipByEventAndUserId>()
        .await
        .unwrap();
    test_driver::wait_for_indexing(&store).await.unwrap();
    store
}
