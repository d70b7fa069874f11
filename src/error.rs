//! Errors surfaced by the offline data accessor.
//!
//! Infrastructure code (storage, config, remote source) reports failures with
//! `color_eyre::Result`. Only the conditions a caller has to render end up here.

use thiserror::Error;

use crate::cache::Role;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
  /// The role may not use this category, or the category is network-only and
  /// the device is offline.
  #[error("Offline access not permitted for role {role} on resource {category}")]
  PermissionDenied { category: String, role: Role },

  /// Offline and no usable cache entry exists.
  #[error("You are offline and no cached data is available for {category}")]
  NoDataAvailable { category: String },

  /// Online fetch failed and nothing could be served instead.
  #[error("Failed to fetch data: {0}")]
  FetchFailed(String),
}

impl AccessError {
  pub fn is_permission_denied(&self) -> bool {
    matches!(self, AccessError::PermissionDenied { .. })
  }

  pub fn is_no_data(&self) -> bool {
    matches!(self, AccessError::NoDataAvailable { .. })
  }
}
