//! Order-independent fingerprint of a provisioning request.

use sha2::{Digest, Sha256};

use crate::models::DesiredSpec;

/// Hash the desired API set together with the owning org and space.
///
/// APIs are fed in sorted order from the set, so submission order and duplicates
/// never change the result. Every field is length-prefixed so that adjacent
/// values cannot run into each other.
pub fn fingerprint(spec: &DesiredSpec, org_id: &str, space_id: &str) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, org_id);
    write_field(&mut hasher, space_id);
    hasher.update((spec.apis.len() as u64).to_be_bytes());
    for api in &spec.apis {
        write_field(&mut hasher, &api.name);
        write_field(&mut hasher, &api.version);
    }
    hex::encode(hasher.finalize())
}

fn write_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}
