//! Per-feed metadata records and the owning-account seam.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Feed identifier → metadata record. Replaced wholesale on load; never
/// patched entry-by-entry by this crate.
pub type MetadataMapping = HashMap<String, FeedMetadata>;

/// The account-level collaborator that owns the mapping. The store only
/// observes it: reads a snapshot for saving, replaces it after loading, and
/// consults the subscribed set for filtering. Mutating entry contents is the
/// owner's business.
pub trait MetadataOwner: Send + Sync {
    fn is_deleted(&self) -> bool;
    fn metadata_snapshot(&self) -> MetadataMapping;
    fn replace_metadata(&self, mapping: MetadataMapping);
    fn subscribed_feed_ids(&self) -> HashSet<String>;
}

/// HTTP conditional-get state for a feed, kept so refreshes can send
/// `If-None-Match` / `If-Modified-Since`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalGetInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// One feed's persisted settings. Every settings field is optional so files
/// written by newer or older versions decode cleanly: unknown fields are
/// ignored, missing fields default to `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub feed_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_about_new_articles: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_extractor_always_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_get_info: Option<ConditionalGetInfo>,

    /// Back-reference to the owning account. Set after load, never
    /// serialized, and non-owning so records do not keep the account alive.
    #[serde(skip)]
    pub owner: Option<Weak<dyn MetadataOwner>>,
}

impl FeedMetadata {
    pub fn new(feed_id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            ..Self::default()
        }
    }

    pub fn attach_owner(&mut self, owner: Weak<dyn MetadataOwner>) {
        self.owner = Some(owner);
    }

    pub fn owner(&self) -> Option<Arc<dyn MetadataOwner>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }
}

// Equality over persisted fields only; the runtime back-reference is not part
// of a record's identity.
impl PartialEq for FeedMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.feed_id == other.feed_id
            && self.edited_name == other.edited_name
            && self.home_page_url == other.home_page_url
            && self.icon_url == other.icon_url
            && self.favicon_url == other.favicon_url
            && self.notify_about_new_articles == other.notify_about_new_articles
            && self.article_extractor_always_on == other.article_extractor_always_on
            && self.external_id == other.external_id
            && self.conditional_get_info == other.conditional_get_info
    }
}
