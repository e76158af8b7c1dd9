use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed document stored as JSON. Ids follow the `"Collection/Name"`
/// convention, e.g. `"User/Ayende"`.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}
