//! Revision fingerprints.
//!
//! A revision is a hex-encoded SHA-1 digest over a sorted list of member
//! revisions. Clients compare revisions to learn that nothing changed since
//! their last poll, so the digest must not depend on input order. Every
//! hashed element is terminated by a NUL byte so that element boundaries
//! are part of the digest.

use sha1::{Digest, Sha1};

/// Fold `revisions` into a digest after sorting them.
///
/// The result only depends on the multiset of inputs.
///
/// # Example
///
/// ```rust
/// use naming_core::revision::compute_revision_by_slice;
///
/// let a = compute_revision_by_slice(&["r2", "r1"]);
/// let b = compute_revision_by_slice(&["r1", "r2"]);
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 40);
/// ```
#[must_use]
pub fn compute_revision_by_slice<S: AsRef<str>>(revisions: &[S]) -> String {
    digest(None, revisions)
}

/// Combine member revisions into one bucket revision.
///
/// Exactly one input is returned unchanged; otherwise the sorted inputs are
/// hashed. No inputs yield the digest of the empty sequence.
#[must_use]
pub fn composite_revision<S: AsRef<str>>(revisions: &[S]) -> String {
    if let [only] = revisions {
        return only.as_ref().to_string();
    }
    compute_revision_by_slice(revisions)
}

/// Revision of a service and its instances.
///
/// The service revision is hashed first, followed by the sorted instance
/// revisions.
#[must_use]
pub fn compute_service_revision<S: AsRef<str>>(service_revision: &str, instances: &[S]) -> String {
    digest(Some(service_revision), instances)
}

fn digest<S: AsRef<str>>(prefix: Option<&str>, revisions: &[S]) -> String {
    let mut sorted: Vec<&str> = revisions.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();

    let mut hasher = Sha1::new();
    if let Some(prefix) = prefix {
        hasher.update(prefix.as_bytes());
        hasher.update([0u8]);
    }
    for revision in sorted {
        hasher.update(revision.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
