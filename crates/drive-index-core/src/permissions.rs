//! Permission normalization.
//!
//! Maps a document's raw access-control entries onto the flat
//! [`PermissionSet`] stored with every record and matched by query filters.

use crate::models::{PermissionSet, RawPermission};

/// Principal emitted for organization-wide (domain) grants.
pub const DOMAIN_PRINCIPAL: &str = "domain";

/// Normalize raw access-control entries into a [`PermissionSet`].
///
/// - `user` and `group` entries contribute their email address.
/// - `domain` entries contribute the literal [`DOMAIN_PRINCIPAL`].
/// - Every other entry type, and user/group entries without an email,
///   is dropped.
/// - An absent or empty entry list yields exactly `{requesting_identity}`:
///   the crawl runs as that identity, so it is the only principal known
///   to have access.
pub fn normalize_permissions(
    raw: Option<&[RawPermission]>,
    requesting_identity: &str,
) -> PermissionSet {
    let entries = match raw {
        Some(entries) if !entries.is_empty() => entries,
        _ => {
            let mut set = PermissionSet::new();
            set.insert(requesting_identity);
            return set;
        }
    };

    entries
        .iter()
        .filter_map(|p| match p.kind.as_str() {
            "domain" => Some(DOMAIN_PRINCIPAL.to_string()),
            "user" | "group" => p.email_address.clone(),
            _ => None,
        })
        .collect()
}
