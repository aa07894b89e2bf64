//! Attachment point for content protection.
//!
//! Key exchange itself lives outside this crate. Before the first segment
//! of a protected asset is requested, the configured [`DrmBinder`] is asked
//! for a [`KeyProvider`] scoped to the asset, and that provider travels with
//! every video segment [`Fetch`](crate::transport::Fetch).

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::error::HozonResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DrmScope {
    pub program_id: String,
    pub content_id: String,
    /// Key identifier announced by the media playlist, e.g. `skd://...`.
    pub key_uri: Option<String>,
}

pub trait KeyProvider: Send + Sync + fmt::Debug {
    fn scope(&self) -> &DrmScope;

    /// Resolve the content key requested by the transfer engine.
    fn content_key<'a>(&'a self, key_uri: &'a str) -> BoxFuture<'a, HozonResult<Vec<u8>>>;
}

pub trait DrmBinder: Send + Sync + 'static {
    fn bind(&self, scope: &DrmScope) -> HozonResult<Arc<dyn KeyProvider>>;
}

impl<F> DrmBinder for F
where
    F: Fn(&DrmScope) -> HozonResult<Arc<dyn KeyProvider>> + Send + Sync + 'static,
{
    fn bind(&self, scope: &DrmScope) -> HozonResult<Arc<dyn KeyProvider>> {
        self(scope)
    }
}
